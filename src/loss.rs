//! 损失函数
//!
//! 标签平滑损失：把 one-hot 目标换成平滑分布，再与模型输出的对数概率比较。
//!
//! 平滑分布模板只在构造时计算一次：
//! ```text
//! t[j]   = smoothing / (V - 2)   (j ≠ pad)
//! t[pad] = 0
//! ```
//! 每个批次复制模板，把真实标签位置改写为 `1 - smoothing`，填充位置整行置零。

use ndarray::{Array1, Array2, Axis};

use crate::config::{validate_smoothing, ModelOptions};
use crate::error::{BeaverError, Result};
use crate::field::Field;
use crate::tensor::{non_pad_mask, TensorExt};

/// 标签平滑损失
#[derive(Debug, Clone)]
pub struct LabelSmoothingLoss {
    label_smoothing: f32,
    vocab_size: usize,
    padding_idx: usize,
    /// 平滑分布模板: [vocab_size]，构造后只读
    one_hot: Array1<f32>,
}

impl LabelSmoothingLoss {
    /// 创建标签平滑损失
    ///
    /// # 参数
    /// - `label_smoothing`: 平滑系数，取值 [0, 1)
    /// - `tgt_vocab_size`: 目标词表大小，至少为 3
    /// - `ignore_index`: 填充 token 的 ID
    pub fn new(label_smoothing: f32, tgt_vocab_size: usize, ignore_index: usize) -> Result<Self> {
        validate_smoothing(label_smoothing)?;
        if tgt_vocab_size <= 2 {
            return Err(BeaverError::invalid_config(format!(
                "target vocabulary size must be at least 3, got {tgt_vocab_size}"
            )));
        }
        if ignore_index >= tgt_vocab_size {
            return Err(BeaverError::invalid_config(format!(
                "padding index {ignore_index} out of range for vocabulary of size {tgt_vocab_size}"
            )));
        }

        let mut one_hot = Array1::from_elem(
            tgt_vocab_size,
            label_smoothing / (tgt_vocab_size - 2) as f32,
        );
        one_hot[ignore_index] = 0.0;

        tracing::info!(
            label_smoothing,
            vocab_size = tgt_vocab_size,
            padding_idx = ignore_index,
            "Label smoothing loss initialized"
        );

        Ok(Self {
            label_smoothing,
            vocab_size: tgt_vocab_size,
            padding_idx: ignore_index,
            one_hot,
        })
    }

    /// 从模型配置和目标字段创建
    pub fn from_options<F: Field + ?Sized>(options: &ModelOptions, field: &F) -> Result<Self> {
        options.validate()?;
        Self::new(options.label_smoothing, field.vocab_len(), field.pad_id())
    }

    pub fn label_smoothing(&self) -> f32 {
        self.label_smoothing
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn padding_idx(&self) -> usize {
        self.padding_idx
    }

    /// 平滑分布模板
    pub fn smoothing_template(&self) -> &Array1<f32> {
        &self.one_hot
    }

    /// 非填充行平滑分布的 Σ t·ln t
    ///
    /// 精确形式（KL）与近似形式（交叉熵）之间相差的就是这个常数。
    pub fn target_entropy(&self) -> f32 {
        let s = self.label_smoothing as f64;
        let xlogx = |x: f64| if x > 0.0 { x * x.ln() } else { 0.0 };
        let per_slot = s / (self.vocab_size - 2) as f64;

        (xlogx(1.0 - s) + (self.vocab_size - 2) as f64 * xlogx(per_slot)) as f32
    }

    /// 检查输入形状并返回非填充 target 数量
    fn check(&self, output: &Array2<f32>, target: &[usize]) -> Result<usize> {
        if output.nrows() != target.len() || output.ncols() != self.vocab_size {
            return Err(BeaverError::ShapeMismatch {
                expected: vec![target.len(), self.vocab_size],
                actual: output.shape().to_vec(),
            });
        }
        if let Some(&token) = target.iter().find(|&&t| t >= self.vocab_size) {
            return Err(BeaverError::TokenOutOfRange {
                token,
                vocab_size: self.vocab_size,
            });
        }

        let numel = target.iter().filter(|&&t| t != self.padding_idx).count();
        if numel == 0 {
            tracing::warn!(batch = target.len(), "Batch has no non-padding target");
            return Err(BeaverError::EmptyTarget);
        }
        Ok(numel)
    }

    /// 构造平滑目标分布: [batch, vocab]
    ///
    /// 填充行全部为零。模板本身不被修改。
    pub fn smoothed_targets(&self, target: &[usize]) -> Array2<f32> {
        let mut truth = Array2::<f32>::zeros((target.len(), self.vocab_size));

        for (mut row, &t) in truth.rows_mut().into_iter().zip(target) {
            if t == self.padding_idx {
                continue;
            }
            row.assign(&self.one_hot);
            row[t] = 1.0 - self.label_smoothing;
        }

        truth
    }

    /// 精确形式：KL(truth ‖ output) 求和后除以非填充 target 数量
    ///
    /// # 输入
    /// - `output`: [batch, vocab] 对数概率
    /// - `target`: [batch] 目标 ID
    pub fn forward(&self, output: &Array2<f32>, target: &[usize]) -> Result<f32> {
        let numel = self.check(output, target)?;

        // 只保留非填充行，填充行不参与求和
        let keep: Vec<usize> = non_pad_mask(target, self.padding_idx)
            .into_iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect();
        let kept_targets: Vec<usize> = keep.iter().map(|&i| target[i]).collect();

        let truth = self.smoothed_targets(&kept_targets);
        let loss = output.select(Axis(0), &keep).kl_div_sum(&truth)?;

        Ok(loss / numel as f32)
    }

    /// 近似形式：分别计算真实标签的 NLL 和全部对数概率之和
    ///
    /// ```text
    /// loss = (1 - ε) * nll + (ε / V) * smooth
    /// ```
    /// 与精确形式相差 `target_entropy()` 和 O(1/V) 的项。
    pub fn forward_approx(&self, output: &Array2<f32>, target: &[usize]) -> Result<f32> {
        let numel = self.check(output, target)?;
        let mask = non_pad_mask(target, self.padding_idx);

        // 填充行的 target 可能是任意合法 ID，先 gather 再掩码
        let picked = output.gather_rows(target)?;
        let row_sums = output.sum_axis(Axis(1));

        let (nll_loss, smooth_loss) = mask
            .iter()
            .zip(picked.iter().zip(row_sums.iter()))
            .filter(|&(&keep, _)| keep)
            .fold((0.0f32, 0.0f32), |(nll, smooth), (_, (&p, &s))| {
                (nll - p, smooth - s)
            });

        let eps_i = self.label_smoothing / self.vocab_size as f32;
        let loss = (1.0 - self.label_smoothing) * nll_loss + eps_i * smooth_loss;

        Ok(loss / numel as f32)
    }

    /// 精确形式关于 `output` 的梯度: `-truth / numel`
    pub fn backward(&self, output: &Array2<f32>, target: &[usize]) -> Result<Array2<f32>> {
        let numel = self.check(output, target)?;
        let truth = self.smoothed_targets(target);

        Ok(truth.mapv(|t| -t / numel as f32))
    }

    /// 近似形式关于 `output` 的梯度
    ///
    /// 非填充行: `-((1 - ε) * onehot + ε / V) / numel`，填充行为零。
    pub fn backward_approx(&self, output: &Array2<f32>, target: &[usize]) -> Result<Array2<f32>> {
        let numel = self.check(output, target)? as f32;
        let eps_i = self.label_smoothing / self.vocab_size as f32;
        let mut grad = Array2::<f32>::zeros(output.dim());

        for (mut row, &t) in grad.rows_mut().into_iter().zip(target) {
            if t == self.padding_idx {
                continue;
            }
            row.fill(-eps_i / numel);
            row[t] -= (1.0 - self.label_smoothing) / numel;
        }

        Ok(grad)
    }
}
