//! 嵌入层和位置编码
//!
//! 将离散的 token ID 转换为连续的向量表示，缩放后加上位置编码，再做 dropout：
//! ```text
//! out = dropout(E[id] * √d + PE[timestep + pos])
//! ```

use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{validate_embedding_dim, ModelOptions};
use crate::error::{BeaverError, Result};
use crate::field::Field;
use crate::layers::Dropout;
use crate::parameter::{HasParameters, Parameter};
use crate::tensor::TensorExt;

/// 位置编码表的默认长度
pub const DEFAULT_MAX_LEN: usize = 1000;

/// 计算正弦位置编码表: [max_len, embedding_dim]
///
/// ```text
/// PE(pos, 2i)   = sin(pos / 10000^(2i/d))
/// PE(pos, 2i+1) = cos(pos / 10000^(2i/d))
/// ```
pub fn positional_encoding(embedding_dim: usize, max_len: usize) -> Array2<f32> {
    let mut pe = Array2::<f32>::zeros((max_len, embedding_dim));
    let log_base = 10000f64.ln() / embedding_dim as f64;

    for pos in 0..max_len {
        for i in (0..embedding_dim).step_by(2) {
            let angle = pos as f64 * (-(i as f64) * log_base).exp();

            pe[[pos, i]] = angle.sin() as f32;
            if i + 1 < embedding_dim {
                pe[[pos, i + 1]] = angle.cos() as f32;
            }
        }
    }

    pe
}

/// 位置编码
///
/// 预计算的只读表，按 `timestep` 偏移取窗口。
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    /// 预计算的位置编码: [max_len, d_model]
    pe: Array2<f32>,
}

impl PositionalEncoding {
    /// 创建新的位置编码
    ///
    /// # 参数
    /// - `max_len`: 最大序列长度
    /// - `d_model`: 嵌入维度
    pub fn new(max_len: usize, d_model: usize) -> Self {
        Self {
            pe: positional_encoding(d_model, max_len),
        }
    }

    pub fn max_len(&self) -> usize {
        self.pe.nrows()
    }

    /// 取 `[timestep, timestep + seq_len)` 行
    pub fn window(&self, timestep: usize, seq_len: usize) -> Result<ArrayView2<'_, f32>> {
        let end = timestep
            .checked_add(seq_len)
            .filter(|&end| end <= self.max_len())
            .ok_or(BeaverError::PositionOutOfRange {
                timestep,
                seq_len,
                max_len: self.max_len(),
            })?;

        Ok(self.pe.slice(s![timestep..end, ..]))
    }

    /// 获取位置编码（用于可视化）
    pub fn encoding(&self) -> &Array2<f32> {
        &self.pe
    }
}

/// 词嵌入 + 位置编码 + dropout
#[derive(Debug, Clone)]
pub struct Embedding {
    /// 权重矩阵: [vocab_size, embedding_dim]，填充行冻结为零
    weight: Parameter,
    pos_encoding: PositionalEncoding,
    dropout: Dropout,
    embedding_dim: usize,
    padding_idx: usize,
    rng: StdRng,
    /// 训练模式下保存的输入 token（用于反向传播）
    input_cache: Option<Array2<usize>>,
}

impl Embedding {
    /// 创建新的嵌入层
    ///
    /// # 参数
    /// - `embedding_dim`: 嵌入维度（正偶数）
    /// - `vocab_size`: 词表大小
    /// - `padding_idx`: 填充 token 的 ID
    /// - `dropout`: dropout 概率
    pub fn new(
        embedding_dim: usize,
        vocab_size: usize,
        padding_idx: usize,
        dropout: f32,
    ) -> Result<Self> {
        Self::build(embedding_dim, vocab_size, padding_idx, dropout, DEFAULT_MAX_LEN)
    }

    fn build(
        embedding_dim: usize,
        vocab_size: usize,
        padding_idx: usize,
        dropout: f32,
        max_len: usize,
    ) -> Result<Self> {
        validate_embedding_dim(embedding_dim)?;
        if padding_idx >= vocab_size {
            return Err(BeaverError::invalid_config(format!(
                "padding index {padding_idx} out of range for vocabulary of size {vocab_size}"
            )));
        }

        let weight = Parameter::new("embedding.weight", Array2::zeros((vocab_size, embedding_dim)))
            .with_frozen_row(padding_idx)?;

        let mut embedding = Self {
            weight,
            pos_encoding: PositionalEncoding::new(max_len, embedding_dim),
            dropout: Dropout::new(dropout)?,
            embedding_dim,
            padding_idx,
            rng: StdRng::from_entropy(),
            input_cache: None,
        };
        embedding.reset_parameters()?;

        tracing::info!(
            vocab_size,
            embedding_dim,
            padding_idx,
            dropout,
            max_len,
            "Embedding initialized"
        );
        Ok(embedding)
    }

    /// 从模型配置和字段创建嵌入层
    ///
    /// 维度、dropout 和位置编码表长度取自 `options`，词表大小和填充 ID 取自 `field`。
    pub fn make<F: Field + ?Sized>(options: &ModelOptions, field: &F) -> Result<Self> {
        options.validate()?;
        Self::build(
            options.embedding_dim,
            field.vocab_len(),
            field.pad_id(),
            options.dropout,
            options.max_len,
        )
    }

    /// 重新计算指定长度的位置编码表
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.pos_encoding = PositionalEncoding::new(max_len, self.embedding_dim);
        self
    }

    /// 固定随机种子并重新初始化参数
    pub fn with_seed(mut self, seed: u64) -> Result<Self> {
        self.rng = StdRng::seed_from_u64(seed);
        self.dropout = self.dropout.with_seed(seed.wrapping_add(1));
        self.reset_parameters()?;
        Ok(self)
    }

    /// 权重 ~ N(0, d^-0.5)，填充行为零
    pub fn reset_parameters(&mut self) -> Result<()> {
        let std_dev = (self.embedding_dim as f32).powf(-0.5);
        let dim = self.weight.value().dim();

        *self.weight.value_mut() = Array2::<f32>::random_normal(dim, std_dev, &mut self.rng)?;
        self.weight.enforce_frozen_rows();
        Ok(())
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.set_training(training);
        if !training {
            self.input_cache = None;
        }
    }

    /// 前向传播（单个序列）
    ///
    /// # 输入
    /// - `tokens`: [seq_len] token IDs
    /// - `timestep`: 第一个 token 的位置
    ///
    /// # 输出
    /// - [seq_len, embedding_dim]
    pub fn forward(&mut self, tokens: &[usize], timestep: usize) -> Result<Array2<f32>> {
        let batch = Array2::from_shape_vec((1, tokens.len()), tokens.to_vec()).map_err(|_| {
            BeaverError::ShapeMismatch {
                expected: vec![1, tokens.len()],
                actual: vec![tokens.len()],
            }
        })?;

        Ok(self.forward_batch(&batch, timestep)?.index_axis_move(Axis(0), 0))
    }

    /// 前向传播（批次）
    ///
    /// # 输入
    /// - `tokens`: [batch_size, seq_len] token IDs
    ///
    /// # 输出
    /// - [batch_size, seq_len, embedding_dim]
    pub fn forward_batch(&mut self, tokens: &Array2<usize>, timestep: usize) -> Result<Array3<f32>> {
        let (batch_size, seq_len) = tokens.dim();
        let pe = self.pos_encoding.window(timestep, seq_len)?;
        let weights = self.weight.value();
        let vocab_size = weights.nrows();
        let scale = (self.embedding_dim as f32).sqrt();

        let mut embedded = Array3::<f32>::zeros((batch_size, seq_len, self.embedding_dim));
        for ((b, t), &token_id) in tokens.indexed_iter() {
            if token_id >= vocab_size {
                return Err(BeaverError::TokenOutOfRange {
                    token: token_id,
                    vocab_size,
                });
            }

            let mut row = embedded.slice_mut(s![b, t, ..]);
            row.assign(&weights.row(token_id));
            row *= scale;
            row += &pe.row(t);
        }

        if self.dropout.is_training() {
            self.input_cache = Some(tokens.clone());
        }
        Ok(self.dropout.forward(&embedded))
    }

    /// 反向传播：把输出梯度累加到对应的词嵌入行
    ///
    /// 填充行不接收梯度；位置编码不是参数，没有梯度。
    pub fn backward(&mut self, grad_output: &Array3<f32>) -> Result<()> {
        let tokens = self
            .input_cache
            .as_ref()
            .ok_or(BeaverError::MissingForwardCache)?;
        let (batch_size, seq_len) = tokens.dim();
        if grad_output.dim() != (batch_size, seq_len, self.embedding_dim) {
            return Err(BeaverError::ShapeMismatch {
                expected: vec![batch_size, seq_len, self.embedding_dim],
                actual: grad_output.shape().to_vec(),
            });
        }

        let grad = self.dropout.backward(grad_output)?;
        let scale = (self.embedding_dim as f32).sqrt();

        for ((b, t), &token_id) in tokens.indexed_iter() {
            let row = grad.slice(s![b, t, ..]).mapv(|g| g * scale);
            self.weight.accumulate_row_grad(token_id, row.view())?;
        }
        Ok(())
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.value().nrows()
    }

    pub fn padding_idx(&self) -> usize {
        self.padding_idx
    }

    /// 词嵌入权重
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn positional(&self) -> &PositionalEncoding {
        &self.pos_encoding
    }
}

impl HasParameters for Embedding {
    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight]
    }
}
