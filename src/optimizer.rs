//! 优化器
//!
//! 实现 SGD 与 Adam。优化器按参数组（`ParamGroup`）组织学习率，
//! 每个组有独立、可修改的 `lr` 字段；`step` 消耗参数中累积的梯度并原地更新。

use ndarray::{Array2, Zip};
use std::collections::HashMap;

use crate::parameter::Parameter;

/// 参数组：共享同一学习率的一组参数名
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    /// 学习率
    pub lr: f32,
    /// 组内参数名
    pub params: Vec<String>,
}

impl ParamGroup {
    pub fn new<I, S>(lr: f32, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lr,
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.iter().any(|p| p == name)
    }
}

/// 在参数组中查找参数对应的学习率
fn group_lr(groups: &[ParamGroup], name: &str) -> Option<f32> {
    groups.iter().find(|g| g.contains(name)).map(|g| g.lr)
}

/// 优化器 trait
pub trait Optimizer {
    /// 参数组
    fn param_groups(&self) -> &[ParamGroup];

    /// 可修改的参数组（调度器通过它写入学习率）
    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// 用累积梯度更新参数
    ///
    /// 不属于任何参数组的参数保持不变。
    fn step(&mut self, params: &mut [&mut Parameter]);

    /// 优化器名称
    fn name(&self) -> &str;

    /// 第一个参数组的学习率
    fn lr(&self) -> f32 {
        self.param_groups().first().map_or(0.0, |g| g.lr)
    }

    /// 为所有参数组设置学习率
    fn set_lr(&mut self, lr: f32) {
        for group in self.param_groups_mut() {
            group.lr = lr;
        }
    }
}

/// SGD（随机梯度下降）
///
/// ```text
/// v = momentum * v + grad
/// param = param - lr * v
/// ```
#[derive(Debug, Clone)]
pub struct SGD {
    groups: Vec<ParamGroup>,
    /// 动量系数
    momentum: f32,
    /// 权重衰减（L2 正则化）
    weight_decay: f32,
    /// 参数的动量（缓存）
    velocities: HashMap<String, Array2<f32>>,
}

impl SGD {
    pub fn new(groups: Vec<ParamGroup>) -> Self {
        Self {
            groups,
            momentum: 0.0,
            weight_decay: 0.0,
            velocities: HashMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for SGD {
    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self, params: &mut [&mut Parameter]) {
        let (momentum, weight_decay) = (self.momentum, self.weight_decay);

        for param in params.iter_mut() {
            let Some(lr) = group_lr(&self.groups, param.name()) else {
                continue;
            };
            let velocity = self
                .velocities
                .entry(param.name().to_string())
                .or_insert_with(|| Array2::zeros(param.value().dim()));

            param.update_with(|value, grad| {
                Zip::from(value)
                    .and(velocity)
                    .and(grad)
                    .for_each(|w, v, &g| {
                        let g = g + weight_decay * *w;
                        *v = momentum * *v + g;
                        *w -= lr * *v;
                    });
            });
        }
    }

    fn name(&self) -> &str {
        "SGD"
    }
}

/// Adam 优化器
///
/// ```text
/// m = β1 * m + (1 - β1) * grad
/// v = β2 * v + (1 - β2) * grad²
/// m_hat = m / (1 - β1^t)
/// v_hat = v / (1 - β2^t)
/// param = param - lr * m_hat / (√v_hat + ε)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    groups: Vec<ParamGroup>,
    /// β1：一阶矩估计的指数衰减率
    beta1: f32,
    /// β2：二阶矩估计的指数衰减率
    beta2: f32,
    /// ε：数值稳定性常数
    eps: f32,
    /// 权重衰减
    weight_decay: f32,
    /// 一阶矩估计
    m: HashMap<String, Array2<f32>>,
    /// 二阶矩估计
    v: HashMap<String, Array2<f32>>,
    /// 时间步
    step: usize,
}

impl Adam {
    pub fn new(groups: Vec<ParamGroup>) -> Self {
        Self {
            groups,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            m: HashMap::new(),
            v: HashMap::new(),
            step: 0,
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn betas(&self) -> (f32, f32) {
        (self.beta1, self.beta2)
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// 已执行的更新次数
    pub fn steps_taken(&self) -> usize {
        self.step
    }
}

impl Optimizer for Adam {
    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self, params: &mut [&mut Parameter]) {
        self.step += 1;

        let (beta1, beta2, eps, weight_decay) =
            (self.beta1, self.beta2, self.eps, self.weight_decay);
        // 偏差修正
        let bias1 = 1.0 - beta1.powi(self.step as i32);
        let bias2 = 1.0 - beta2.powi(self.step as i32);

        for param in params.iter_mut() {
            let Some(lr) = group_lr(&self.groups, param.name()) else {
                continue;
            };
            let dim = param.value().dim();
            let m = self
                .m
                .entry(param.name().to_string())
                .or_insert_with(|| Array2::zeros(dim));
            let v = self
                .v
                .entry(param.name().to_string())
                .or_insert_with(|| Array2::zeros(dim));

            param.update_with(|value, grad| {
                Zip::from(value)
                    .and(m)
                    .and(v)
                    .and(grad)
                    .for_each(|w, m_i, v_i, &g| {
                        let g = g + weight_decay * *w;
                        *m_i = beta1 * *m_i + (1.0 - beta1) * g;
                        *v_i = beta2 * *v_i + (1.0 - beta2) * g * g;

                        let m_hat = *m_i / bias1;
                        let v_hat = *v_i / bias2;
                        *w -= lr * m_hat / (v_hat.sqrt() + eps);
                    });
            });
        }
    }

    fn name(&self) -> &str {
        "Adam"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn param(value: Array2<f32>, grad: Array2<f32>) -> Parameter {
        let mut p = Parameter::new("test", value);
        p.accumulate_grad(&grad).unwrap();
        p
    }

    #[test]
    fn test_sgd() {
        let mut optimizer = SGD::new(vec![ParamGroup::new(0.01, ["test"])]);
        let mut p = param(arr2(&[[1.0, 2.0]]), arr2(&[[0.1, 0.2]]));

        optimizer.step(&mut [&mut p]);

        // param = param - lr * grad
        assert_abs_diff_eq!(p.value()[[0, 0]], 0.999, epsilon = 1e-5);
        assert_abs_diff_eq!(p.value()[[0, 1]], 1.998, epsilon = 1e-5);
    }

    #[test]
    fn test_sgd_momentum() {
        let mut optimizer = SGD::new(vec![ParamGroup::new(0.01, ["test"])]).with_momentum(0.9);
        let mut p = param(arr2(&[[1.0]]), arr2(&[[0.1]]));

        optimizer.step(&mut [&mut p]);
        optimizer.step(&mut [&mut p]);

        // 0.001 + 0.01 * (0.9 * 0.1 + 0.1)
        assert_abs_diff_eq!(p.value()[[0, 0]], 1.0 - 0.001 - 0.0019, epsilon = 1e-6);
    }

    #[test]
    fn test_adam_first_step() {
        let mut optimizer = Adam::new(vec![ParamGroup::new(0.01, ["test"])]);
        let mut p = param(arr2(&[[1.0, 2.0]]), arr2(&[[0.1, -0.2]]));

        optimizer.step(&mut [&mut p]);

        // 第一步偏差修正后 m_hat / √v_hat = sign(grad)
        assert_abs_diff_eq!(p.value()[[0, 0]], 0.99, epsilon = 1e-5);
        assert_abs_diff_eq!(p.value()[[0, 1]], 2.01, epsilon = 1e-5);
        assert_eq!(optimizer.steps_taken(), 1);
    }

    #[test]
    fn test_param_outside_groups_untouched() {
        let mut optimizer = Adam::new(vec![ParamGroup::new(0.01, ["other"])]);
        let mut p = param(arr2(&[[1.0]]), arr2(&[[1.0]]));

        optimizer.step(&mut [&mut p]);

        assert_eq!(p.value()[[0, 0]], 1.0);
    }

    #[test]
    fn test_per_group_lr() {
        let mut optimizer = SGD::new(vec![
            ParamGroup::new(0.1, ["a"]),
            ParamGroup::new(0.5, ["b"]),
        ]);
        let mut a = Parameter::new("a", arr2(&[[1.0]]));
        let mut b = Parameter::new("b", arr2(&[[1.0]]));
        a.accumulate_grad(&arr2(&[[1.0]])).unwrap();
        b.accumulate_grad(&arr2(&[[1.0]])).unwrap();

        optimizer.step(&mut [&mut a, &mut b]);

        assert_abs_diff_eq!(a.value()[[0, 0]], 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(b.value()[[0, 0]], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_lr_scheduling() {
        let mut optimizer = SGD::new(vec![
            ParamGroup::new(0.01, ["a"]),
            ParamGroup::new(0.02, ["b"]),
        ]);

        assert_eq!(optimizer.lr(), 0.01);

        optimizer.set_lr(0.001);

        assert!(optimizer.param_groups().iter().all(|g| g.lr == 0.001));
    }
}
