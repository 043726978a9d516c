//! 张量操作扩展和工具函数
//!
//! 基于 ndarray 实现损失函数和嵌入层所需的张量操作：
//! 正态初始化、log-softmax、按索引 gather、KL 散度求和以及填充掩码。

use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{BeaverError, Result};

/// 张量扩展 trait
pub trait TensorExt<T> {
    /// 创建正态分布随机张量 N(0, std²)
    fn random_normal<R: Rng + ?Sized>(
        shape: (usize, usize),
        std_dev: T,
        rng: &mut R,
    ) -> Result<Array2<T>>
    where
        T: num_traits::Float;

    /// 沿指定维度计算 log-softmax
    fn log_softmax(&self, axis: usize) -> Array2<T>
    where
        T: num_traits::Float;

    /// 每行按索引取一个元素：`out[i] = self[i, index[i]]`
    fn gather_rows(&self, index: &[usize]) -> Result<Array1<T>>
    where
        T: Copy;

    /// KL 散度（求和归约）
    ///
    /// `self` 为对数概率，`target` 为概率：
    /// ```text
    /// Σ t * (ln t - x)，其中 t = 0 的项记为 0
    /// ```
    fn kl_div_sum(&self, target: &Array2<T>) -> Result<T>
    where
        T: num_traits::Float;
}

/// 为 f32 实现张量扩展
impl TensorExt<f32> for Array2<f32> {
    fn random_normal<R: Rng + ?Sized>(
        shape: (usize, usize),
        std_dev: f32,
        rng: &mut R,
    ) -> Result<Array2<f32>> {
        if !(std_dev >= 0.0 && std_dev.is_finite()) {
            return Err(BeaverError::invalid_config(format!(
                "normal init std must be finite and non-negative, got {std_dev}"
            )));
        }
        let normal = Normal::new(0.0, std_dev).map_err(|e| {
            BeaverError::invalid_config(format!("normal init with std {std_dev}: {e}"))
        })?;

        Ok(Array2::from_shape_fn(shape, |_| normal.sample(rng)))
    }

    fn log_softmax(&self, axis: usize) -> Array2<f32> {
        // 减去最大值以提高数值稳定性
        let max = self.fold_axis(Axis(axis), f32::NEG_INFINITY, |a, &b| a.max(b));
        let shifted = self - &max.insert_axis(Axis(axis));

        let log_sum = shifted
            .mapv(f32::exp)
            .sum_axis(Axis(axis))
            .mapv(f32::ln);

        shifted - &log_sum.insert_axis(Axis(axis))
    }

    fn gather_rows(&self, index: &[usize]) -> Result<Array1<f32>> {
        if index.len() != self.nrows() {
            return Err(BeaverError::ShapeMismatch {
                expected: vec![self.nrows()],
                actual: vec![index.len()],
            });
        }

        let mut out = Array1::zeros(index.len());
        for (i, &j) in index.iter().enumerate() {
            if j >= self.ncols() {
                return Err(BeaverError::TokenOutOfRange {
                    token: j,
                    vocab_size: self.ncols(),
                });
            }
            out[i] = self[[i, j]];
        }

        Ok(out)
    }

    fn kl_div_sum(&self, target: &Array2<f32>) -> Result<f32> {
        if self.dim() != target.dim() {
            return Err(BeaverError::ShapeMismatch {
                expected: target.shape().to_vec(),
                actual: self.shape().to_vec(),
            });
        }

        let loss = self
            .iter()
            .zip(target.iter())
            .filter(|&(_, &t)| t > 0.0)
            .map(|(&x, &t)| t * (t.ln() - x))
            .sum();

        Ok(loss)
    }
}

/// 辅助函数：非填充掩码（`true` 表示有效 target）
pub fn non_pad_mask(target: &[usize], padding_idx: usize) -> Vec<bool> {
    target.iter().map(|&t| t != padding_idx).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_log_softmax() {
        let x = arr2(&[[1.0f32, 2.0, 3.0], [1000.0, 1000.0, 1000.0]]);
        let y = x.log_softmax(1);

        for row in y.rows() {
            let sum: f32 = row.iter().map(|v| v.exp()).sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-5);
        }
        // 大数值不会溢出
        assert_abs_diff_eq!(y[[1, 0]], -(3.0f32).ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_gather_rows() {
        let x = arr2(&[[0.1f32, 0.2, 0.3], [0.4, 0.5, 0.6]]);
        let g = x.gather_rows(&[2, 0]).unwrap();

        assert_eq!(g.to_vec(), vec![0.3, 0.4]);
        assert!(x.gather_rows(&[0]).is_err());
        assert!(x.gather_rows(&[0, 3]).is_err());
    }

    #[test]
    fn test_kl_div_sum() {
        let target = arr2(&[[0.5f32, 0.5, 0.0]]);
        // 与 target 相同的分布：KL = 0，零概率位置不参与
        let output = arr2(&[[0.5f32.ln(), 0.5f32.ln(), -100.0]]);

        let kl = output.kl_div_sum(&target).unwrap();
        assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-6);

        let uniform = arr2(&[[(1.0f32 / 3.0).ln(); 3]]);
        let kl = uniform.kl_div_sum(&target).unwrap();
        assert_abs_diff_eq!(kl, (1.5f32).ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_random_normal_std() {
        let mut rng = StdRng::seed_from_u64(7);
        let x = Array2::<f32>::random_normal((200, 100), 0.5, &mut rng).unwrap();

        let mean = x.mean().unwrap();
        let var = x.mapv(|v| (v - mean) * (v - mean)).mean().unwrap();
        assert_abs_diff_eq!(mean, 0.0, epsilon = 0.02);
        assert_abs_diff_eq!(var.sqrt(), 0.5, epsilon = 0.02);

        assert!(Array2::<f32>::random_normal((2, 2), -1.0, &mut rng).is_err());
        assert!(Array2::<f32>::random_normal((2, 2), f32::NAN, &mut rng).is_err());
        assert!(Array2::<f32>::random_normal((2, 2), f32::INFINITY, &mut rng).is_err());
        assert!(Array2::<f32>::random_normal((2, 2), 0.0, &mut rng).is_ok());
    }

    #[test]
    fn test_non_pad_mask() {
        assert_eq!(non_pad_mask(&[0, 3, 0, 1], 0), vec![false, true, false, true]);
    }
}
