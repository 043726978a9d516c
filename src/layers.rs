//! 基础层
//!
//! 目前只有 Dropout。

use ndarray::{Array, ArrayD, Dimension};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::validate_dropout;
use crate::error::{BeaverError, Result};

/// Dropout 层
///
/// 训练时以概率 p 把元素置零，其余元素乘以 `1 / (1 - p)` 以保持期望值；
/// 推理时原样输出。训练模式下保存掩码，用于反向传播。
#[derive(Debug, Clone)]
pub struct Dropout {
    dropout_prob: f32,
    training: bool,
    rng: StdRng,
    /// 上一次前向传播的缩放掩码（0 或 1 / (1 - p)）
    mask: Option<ArrayD<f32>>,
}

impl Dropout {
    pub fn new(dropout_prob: f32) -> Result<Self> {
        validate_dropout(dropout_prob)?;

        Ok(Self {
            dropout_prob,
            training: true,
            rng: StdRng::from_entropy(),
            mask: None,
        })
    }

    /// 固定随机种子（用于复现）
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.mask = None;
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn prob(&self) -> f32 {
        self.dropout_prob
    }

    /// 前向传播
    pub fn forward<D: Dimension>(&mut self, x: &Array<f32, D>) -> Array<f32, D> {
        if !self.training {
            return x.clone();
        }

        let keep = 1.0 - self.dropout_prob;
        let p = self.dropout_prob;
        let rng = &mut self.rng;
        let mask = x.mapv(|_| {
            if p > 0.0 && rng.gen::<f32>() < p {
                0.0
            } else {
                1.0 / keep
            }
        });

        let out = x * &mask;
        self.mask = Some(mask.into_dyn());
        out
    }

    /// 反向传播：梯度乘以前向时的掩码
    pub fn backward<D: Dimension>(&self, grad_output: &Array<f32, D>) -> Result<Array<f32, D>> {
        if !self.training {
            return Ok(grad_output.clone());
        }

        let mask = self.mask.as_ref().ok_or(BeaverError::MissingForwardCache)?;
        let mask = mask
            .view()
            .into_dimensionality::<D>()
            .map_err(|_| BeaverError::ShapeMismatch {
                expected: mask.shape().to_vec(),
                actual: grad_output.shape().to_vec(),
            })?;
        if mask.shape() != grad_output.shape() {
            return Err(BeaverError::ShapeMismatch {
                expected: mask.shape().to_vec(),
                actual: grad_output.shape().to_vec(),
            });
        }

        Ok(grad_output * &mask)
    }
}
