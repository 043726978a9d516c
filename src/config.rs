//! 训练配置
//!
//! 模型与优化器的超参数，可从 JSON 文件加载或保存。

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{BeaverError, Result};

/// 模型超参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    /// 隐层维度（调度公式中的 d）
    pub hidden_size: usize,
    /// 嵌入维度
    pub embedding_dim: usize,
    /// 嵌入层 dropout 概率
    pub dropout: f32,
    /// 标签平滑系数
    pub label_smoothing: f32,
    /// 位置编码表长度
    pub max_len: usize,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            hidden_size: 512,
            embedding_dim: 512,
            dropout: 0.1,
            label_smoothing: 0.1,
            max_len: 1000,
        }
    }
}

impl ModelOptions {
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 {
            return Err(BeaverError::invalid_config("hidden_size must be positive"));
        }
        validate_embedding_dim(self.embedding_dim)?;
        validate_dropout(self.dropout)?;
        validate_smoothing(self.label_smoothing)?;
        if self.max_len == 0 {
            return Err(BeaverError::invalid_config("max_len must be positive"));
        }
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options: Self = load_json(path)?;
        options.validate()?;
        Ok(options)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_json(self, path)
    }
}

/// 优化器超参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimOptions {
    /// 基础学习率
    pub lr: f32,
    /// 预热步数
    pub warm_up: usize,
    /// 初始步数（恢复训练时使用）
    pub init_step: usize,
    /// Adam 的 (β1, β2)
    pub betas: (f32, f32),
    /// Adam 的 ε
    pub eps: f32,
}

impl Default for OptimOptions {
    fn default() -> Self {
        Self {
            lr: 2.0,
            warm_up: 4000,
            init_step: 0,
            betas: (0.9, 0.98),
            eps: 1e-9,
        }
    }
}

impl OptimOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(BeaverError::invalid_config(format!(
                "lr must be positive, got {}",
                self.lr
            )));
        }
        if self.warm_up == 0 {
            return Err(BeaverError::invalid_config("warm_up must be positive"));
        }
        let (beta1, beta2) = self.betas;
        if !((0.0..1.0).contains(&beta1) && (0.0..1.0).contains(&beta2)) {
            return Err(BeaverError::invalid_config(format!(
                "betas must lie in [0, 1), got ({beta1}, {beta2})"
            )));
        }
        if !(self.eps > 0.0 && self.eps.is_finite()) {
            return Err(BeaverError::invalid_config(format!(
                "eps must be positive and finite, got {}",
                self.eps
            )));
        }
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options: Self = load_json(path)?;
        options.validate()?;
        Ok(options)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_json(self, path)
    }
}

pub(crate) fn validate_embedding_dim(embedding_dim: usize) -> Result<()> {
    if embedding_dim == 0 || embedding_dim % 2 != 0 {
        return Err(BeaverError::invalid_config(format!(
            "embedding_dim must be a positive even number, got {embedding_dim}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_dropout(dropout: f32) -> Result<()> {
    if !(0.0..1.0).contains(&dropout) {
        return Err(BeaverError::invalid_config(format!(
            "dropout must lie in [0, 1), got {dropout}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_smoothing(label_smoothing: f32) -> Result<()> {
    if !(0.0..1.0).contains(&label_smoothing) {
        return Err(BeaverError::invalid_config(format!(
            "label_smoothing must lie in [0, 1), got {label_smoothing}"
        )));
    }
    Ok(())
}

fn load_json<T, P>(path: P) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

fn save_json<T, P>(value: &T, path: P) -> Result<()>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

/// 预设配置
pub mod configs {
    use super::{ModelOptions, OptimOptions};

    /// 基础模型（d = 512，预热 4000 步）
    pub fn base() -> (ModelOptions, OptimOptions) {
        (ModelOptions::default(), OptimOptions::default())
    }

    /// 小型模型（用于快速测试）
    pub fn mini() -> (ModelOptions, OptimOptions) {
        let model = ModelOptions {
            hidden_size: 32,
            embedding_dim: 32,
            dropout: 0.0,
            label_smoothing: 0.1,
            max_len: 64,
        };
        let optim = OptimOptions {
            warm_up: 100,
            ..OptimOptions::default()
        };
        (model, optim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for (model, optim) in [configs::base(), configs::mini()] {
            model.validate().unwrap();
            optim.validate().unwrap();
        }
    }

    #[test]
    fn test_invalid_options() {
        let model = ModelOptions {
            label_smoothing: 1.0,
            ..ModelOptions::default()
        };
        assert!(model.validate().is_err());

        let model = ModelOptions {
            embedding_dim: 33,
            ..ModelOptions::default()
        };
        assert!(model.validate().is_err());

        let optim = OptimOptions {
            warm_up: 0,
            ..OptimOptions::default()
        };
        assert!(optim.validate().is_err());

        for eps in [0.0, -1e-9, f32::NAN, f32::INFINITY] {
            let optim = OptimOptions {
                eps,
                ..OptimOptions::default()
            };
            assert!(optim.validate().is_err(), "eps = {eps}");
        }
    }

    #[test]
    fn test_json_roundtrip_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let (model, optim) = configs::mini();
        model.save_json(&path).unwrap();
        assert_eq!(ModelOptions::load_json(&path).unwrap(), model);

        // 缺省字段使用默认值
        let optim_path = dir.path().join("optim.json");
        std::fs::write(&optim_path, r#"{ "warm_up": 100 }"#).unwrap();
        assert_eq!(OptimOptions::load_json(&optim_path).unwrap(), optim);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "dropout": 1.5 }"#).unwrap();

        assert!(matches!(
            ModelOptions::load_json(&path),
            Err(BeaverError::InvalidConfig { .. })
        ));
        assert!(matches!(
            ModelOptions::load_json(dir.path().join("missing.json")),
            Err(BeaverError::Io { .. })
        ));
    }
}
