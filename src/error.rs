//! 错误类型
//!
//! 所有前置条件检查（配置、批次、位置窗口）都通过 `BeaverError` 返回。

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BeaverError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Batch contains no non-padding target")]
    EmptyTarget,

    #[error("Position window {timestep}..{} exceeds positional table length {max_len}", .timestep + .seq_len)]
    PositionOutOfRange {
        timestep: usize,
        seq_len: usize,
        max_len: usize,
    },

    #[error("Token id {token} out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    #[error("Backward called without a cached forward pass")]
    MissingForwardCache,

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl BeaverError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BeaverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_message() {
        let err = BeaverError::PositionOutOfRange {
            timestep: 998,
            seq_len: 5,
            max_len: 1000,
        };
        assert_eq!(
            err.to_string(),
            "Position window 998..1003 exceeds positional table length 1000"
        );
    }
}
