//! 可训练参数
//!
//! `Parameter` 保存参数值和累积梯度，由模型持有、由优化器按名字更新。
//! 被冻结的行（例如嵌入表中的填充行）不接收梯度，并在每次更新后重新置零。

use ndarray::{Array2, ArrayView1};

use crate::error::{BeaverError, Result};

/// 带梯度的命名参数
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    /// 参数值
    value: Array2<f32>,
    /// 累积梯度，与 value 形状相同
    grad: Array2<f32>,
    /// 恒为零的行
    frozen_rows: Vec<usize>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Array2<f32>) -> Self {
        let grad = Array2::zeros(value.dim());
        Self {
            name: name.into(),
            value,
            grad,
            frozen_rows: Vec::new(),
        }
    }

    /// 冻结一行并立即置零
    pub fn with_frozen_row(mut self, row: usize) -> Result<Self> {
        if row >= self.value.nrows() {
            return Err(BeaverError::invalid_config(format!(
                "frozen row {} out of range for parameter '{}' with {} rows",
                row,
                self.name,
                self.value.nrows()
            )));
        }
        if !self.frozen_rows.contains(&row) {
            self.frozen_rows.push(row);
        }
        self.enforce_frozen_rows();
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Array2<f32> {
        &self.value
    }

    /// 直接修改参数值（加载权重等）
    ///
    /// 冻结行在下一次优化器更新时恢复为零。
    pub fn value_mut(&mut self) -> &mut Array2<f32> {
        &mut self.value
    }

    pub fn grad(&self) -> &Array2<f32> {
        &self.grad
    }

    pub fn frozen_rows(&self) -> &[usize] {
        &self.frozen_rows
    }

    /// 累加整块梯度，冻结行被忽略
    pub fn accumulate_grad(&mut self, grad: &Array2<f32>) -> Result<()> {
        if grad.dim() != self.grad.dim() {
            return Err(BeaverError::ShapeMismatch {
                expected: self.grad.shape().to_vec(),
                actual: grad.shape().to_vec(),
            });
        }

        self.grad += grad;
        for &row in &self.frozen_rows {
            self.grad.row_mut(row).fill(0.0);
        }
        Ok(())
    }

    /// 累加单行梯度（嵌入查找的反向传播）
    pub fn accumulate_row_grad(&mut self, row: usize, grad: ArrayView1<f32>) -> Result<()> {
        if row >= self.grad.nrows() {
            return Err(BeaverError::TokenOutOfRange {
                token: row,
                vocab_size: self.grad.nrows(),
            });
        }
        if grad.len() != self.grad.ncols() {
            return Err(BeaverError::ShapeMismatch {
                expected: vec![self.grad.ncols()],
                actual: vec![grad.len()],
            });
        }
        if self.frozen_rows.contains(&row) {
            return Ok(());
        }

        let mut target = self.grad.row_mut(row);
        target += &grad;
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// 用优化器给出的更新规则原地修改参数，随后恢复冻结行
    pub fn update_with<F>(&mut self, update: F)
    where
        F: FnOnce(&mut Array2<f32>, &Array2<f32>),
    {
        update(&mut self.value, &self.grad);

        if self.enforce_frozen_rows() {
            tracing::warn!(parameter = %self.name, "Frozen row drifted during update, re-zeroed");
        }
    }

    /// 将冻结行置零，返回是否有行偏离了零
    pub fn enforce_frozen_rows(&mut self) -> bool {
        let mut drifted = false;
        for &row in &self.frozen_rows {
            let mut r = self.value.row_mut(row);
            if r.iter().any(|&v| v != 0.0) {
                drifted = true;
                r.fill(0.0);
            }
        }
        drifted
    }

    /// 参数数量
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// 持有可训练参数的模块
pub trait HasParameters {
    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// 清空所有参数的梯度
    fn zero_grad(&mut self) {
        for param in self.parameters_mut() {
            param.zero_grad();
        }
    }

    /// 参数名列表（用于构建优化器的参数组）
    fn parameter_names(&self) -> Vec<String> {
        self.parameters()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }
}
