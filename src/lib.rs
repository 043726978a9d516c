//! # Beaver
//!
//! 序列到序列模型训练中的三个基础组件：
//!
//! ```text
//! tokens → Embedding (E[id]·√d + PE[t]) → Dropout → ... 模型 ...
//!     → log-probs → LabelSmoothingLoss
//!
//! grads → WarmAdam: lr = lr0 · d^-0.5 · min(n^-0.5, n·w^-1.5) → Adam
//! ```
//!
//! 张量运算基于 ndarray，没有自动微分：损失和嵌入层各自提供 `backward`，
//! 梯度累积在 `Parameter` 中，由优化器消耗。

pub mod config;
pub mod embedding;
pub mod error;
pub mod field;
pub mod layers;
pub mod loss;
pub mod lr_scheduler;
pub mod optimizer;
pub mod parameter;
pub mod tensor;

pub use config::{configs, ModelOptions, OptimOptions};
pub use embedding::{positional_encoding, Embedding, PositionalEncoding, DEFAULT_MAX_LEN};
pub use error::{BeaverError, Result};
pub use field::{Field, Vocabulary};
pub use layers::Dropout;
pub use loss::LabelSmoothingLoss;
pub use lr_scheduler::{LRScheduler, NoamLR, ScheduleState, WarmAdam, WarmupOptimizer};
pub use optimizer::{Adam, Optimizer, ParamGroup, SGD};
pub use parameter::{HasParameters, Parameter};
pub use tensor::TensorExt;
