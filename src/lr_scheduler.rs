//! 学习率调度器
//!
//! 实现 Transformer 的预热调度（Noam 调度），以及把调度器包在优化器外面的
//! `WarmupOptimizer`：每一步先写入新的学习率，再委托给内部优化器更新参数。

use serde::{Deserialize, Serialize};

use crate::config::{ModelOptions, OptimOptions};
use crate::error::{BeaverError, Result};
use crate::optimizer::{Adam, Optimizer, ParamGroup};
use crate::parameter::Parameter;

/// 学习率调度器 trait
pub trait LRScheduler {
    /// 获取当前步骤的学习率
    fn get_lr(&self, step: usize) -> f32;

    /// 调度器名称
    fn name(&self) -> &str;
}

/// 预热 + 平方根倒数衰减
///
/// ```text
/// warm = min(n^-0.5, n * w^-1.5)
/// lr   = base_lr * d^-0.5 * warm
/// ```
///
/// `n < w` 时线性增长，`n = w` 时达到峰值，之后按 `n^-0.5` 衰减。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoamLR {
    base_lr: f32,
    hidden_size: usize,
    warm_up: usize,
}

impl NoamLR {
    pub fn new(base_lr: f32, hidden_size: usize, warm_up: usize) -> Result<Self> {
        if !(base_lr > 0.0 && base_lr.is_finite()) {
            return Err(BeaverError::invalid_config(format!(
                "base learning rate must be positive, got {base_lr}"
            )));
        }
        if hidden_size == 0 {
            return Err(BeaverError::invalid_config("hidden size must be positive"));
        }
        if warm_up == 0 {
            return Err(BeaverError::invalid_config("warm-up length must be positive"));
        }

        Ok(Self {
            base_lr,
            hidden_size,
            warm_up,
        })
    }

    pub fn base_lr(&self) -> f32 {
        self.base_lr
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn warm_up(&self) -> usize {
        self.warm_up
    }

    /// 预热因子 `min(n^-0.5, n * w^-1.5)`
    ///
    /// `n = 0` 时为 0。
    pub fn warm_factor(&self, step: usize) -> f64 {
        let n = step as f64;
        let w = self.warm_up as f64;
        n.powf(-0.5).min(n * w.powf(-1.5))
    }
}

impl LRScheduler for NoamLR {
    fn get_lr(&self, step: usize) -> f32 {
        let scale = self.base_lr as f64 * (self.hidden_size as f64).powf(-0.5);
        (scale * self.warm_factor(step)) as f32
    }

    fn name(&self) -> &str {
        "NoamLR"
    }
}

/// 调度器状态快照（用于恢复训练）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub n_step: usize,
    pub lr: f32,
}

/// 带预热调度的优化器包装
///
/// 持有内部优化器的所有权，只对外暴露 `step`。
#[derive(Debug, Clone)]
pub struct WarmupOptimizer<O: Optimizer> {
    schedule: NoamLR,
    /// 已完成的步数，只增不减
    n_step: usize,
    /// 最近一次写入的学习率
    lr: f32,
    optimizer: O,
}

/// 包装 Adam(β = (0.9, 0.98), ε = 1e-9) 的预热优化器
pub type WarmAdam = WarmupOptimizer<Adam>;

impl<O: Optimizer> WarmupOptimizer<O> {
    /// 包装任意优化器，`init_step` 为已完成的步数（从头训练时为 0）
    pub fn wrap(optimizer: O, schedule: NoamLR, init_step: usize) -> Self {
        tracing::info!(
            optimizer = optimizer.name(),
            base_lr = schedule.base_lr(),
            hidden_size = schedule.hidden_size(),
            warm_up = schedule.warm_up(),
            init_step,
            "Warm-up schedule initialized"
        );

        Self {
            schedule,
            n_step: init_step,
            lr: schedule.base_lr(),
            optimizer,
        }
    }

    /// 从保存的调度状态恢复
    ///
    /// 下一次 `step` 使用第 `state.n_step + 1` 步的学习率。
    pub fn resume(optimizer: O, schedule: NoamLR, state: ScheduleState) -> Self {
        let mut resumed = Self::wrap(optimizer, schedule, state.n_step);
        resumed.lr = state.lr;
        resumed
    }

    /// 推进一步：更新步数、计算学习率、写入所有参数组，再执行内部优化器的更新
    ///
    /// 返回本步使用的学习率。
    pub fn step(&mut self, params: &mut [&mut Parameter]) -> f32 {
        self.n_step += 1;
        self.lr = self.schedule.get_lr(self.n_step);

        for group in self.optimizer.param_groups_mut() {
            group.lr = self.lr;
        }
        tracing::debug!(step = self.n_step, lr = self.lr, "Warm-up step");

        self.optimizer.step(params);
        self.lr
    }

    /// 当前学习率
    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn n_step(&self) -> usize {
        self.n_step
    }

    pub fn schedule(&self) -> &NoamLR {
        &self.schedule
    }

    /// 内部优化器（只读）
    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn param_groups(&self) -> &[ParamGroup] {
        self.optimizer.param_groups()
    }

    pub fn state(&self) -> ScheduleState {
        ScheduleState {
            n_step: self.n_step,
            lr: self.lr,
        }
    }
}

impl WarmupOptimizer<Adam> {
    /// 创建预热 Adam
    ///
    /// # 参数
    /// - `params`: 参与更新的参数名
    /// - `lr`: 基础学习率
    /// - `hidden_size`: 模型隐层维度
    /// - `warm_up`: 预热步数
    /// - `init_step`: 初始步数
    pub fn new<I, S>(
        params: I,
        lr: f32,
        hidden_size: usize,
        warm_up: usize,
        init_step: usize,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let schedule = NoamLR::new(lr, hidden_size, warm_up)?;
        let adam = Adam::new(vec![ParamGroup::new(lr, params)])
            .with_betas(0.9, 0.98)
            .with_eps(1e-9);

        Ok(Self::wrap(adam, schedule, init_step))
    }

    /// 从优化配置创建，调度公式中的 d 取 `model.hidden_size`
    pub fn from_options<I, S>(
        options: &OptimOptions,
        model: &ModelOptions,
        params: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        options.validate()?;
        model.validate()?;

        let schedule = NoamLR::new(options.lr, model.hidden_size, options.warm_up)?;
        let adam = Adam::new(vec![ParamGroup::new(options.lr, params)])
            .with_betas(options.betas.0, options.betas.1)
            .with_eps(options.eps);

        Ok(Self::wrap(adam, schedule, options.init_step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::configs;
    use crate::optimizer::SGD;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::arr2;

    fn noam() -> NoamLR {
        NoamLR::new(2.0, 512, 4000).unwrap()
    }

    #[test]
    fn test_warmup_increases_then_decays() {
        let scheduler = noam();

        for n in 1..4000 {
            assert!(scheduler.get_lr(n + 1) > scheduler.get_lr(n), "step {n}");
        }
        for n in 4000..20000 {
            assert!(scheduler.get_lr(n + 1) < scheduler.get_lr(n), "step {n}");
        }

        let peak = scheduler.get_lr(4000);
        let expected = 2.0 / (512.0f32).sqrt() / (4000.0f32).sqrt();
        assert_relative_eq!(peak, expected, max_relative = 1e-5);
    }

    #[test]
    fn test_decay_follows_inverse_sqrt() {
        let scheduler = noam();

        for n in [10_000, 50_000, 250_000] {
            let ratio = scheduler.get_lr(4 * n) / scheduler.get_lr(n);
            assert_abs_diff_eq!(ratio, 0.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_linear_warmup() {
        let scheduler = noam();

        // 预热阶段 lr ∝ n
        let ratio = scheduler.get_lr(200) / scheduler.get_lr(100);
        assert_abs_diff_eq!(ratio, 2.0, epsilon = 1e-5);
        assert_eq!(scheduler.get_lr(0), 0.0);
    }

    #[test]
    fn test_invalid_schedule() {
        assert!(NoamLR::new(0.0, 512, 4000).is_err());
        assert!(NoamLR::new(2.0, 0, 4000).is_err());
        assert!(NoamLR::new(2.0, 512, 0).is_err());
    }

    #[test]
    fn test_step_writes_lr_to_all_groups() {
        let sgd = SGD::new(vec![
            ParamGroup::new(1.0, ["a"]),
            ParamGroup::new(1.0, ["b"]),
        ]);
        let mut opt = WarmupOptimizer::wrap(sgd, noam(), 0);
        let mut a = Parameter::new("a", arr2(&[[1.0]]));
        let mut b = Parameter::new("b", arr2(&[[1.0]]));

        let lr = opt.step(&mut [&mut a, &mut b]);

        assert_eq!(opt.n_step(), 1);
        assert_eq!(lr, noam().get_lr(1));
        assert!(opt.param_groups().iter().all(|g| g.lr == lr));
    }

    #[test]
    fn test_step_delegates_update() {
        let sgd = SGD::new(vec![ParamGroup::new(1.0, ["w"])]);
        let mut opt = WarmupOptimizer::wrap(sgd, noam(), 0);
        let mut w = Parameter::new("w", arr2(&[[1.0]]));
        w.accumulate_grad(&arr2(&[[1.0]])).unwrap();

        let lr = opt.step(&mut [&mut w]);

        assert_relative_eq!(w.value()[[0, 0]], 1.0 - lr, max_relative = 1e-6);
    }

    #[test]
    fn test_warm_adam_resume() {
        let mut opt = WarmAdam::new(["w"], 2.0, 512, 4000, 100).unwrap();
        let mut w = Parameter::new("w", arr2(&[[0.5]]));

        opt.step(&mut [&mut w]);

        assert_eq!(opt.n_step(), 101);
        assert_eq!(opt.lr(), noam().get_lr(101));
        assert_eq!(opt.optimizer().betas(), (0.9, 0.98));
        assert_eq!(opt.optimizer().eps(), 1e-9);
        assert_eq!(
            opt.state(),
            ScheduleState {
                n_step: 101,
                lr: noam().get_lr(101)
            }
        );
    }

    #[test]
    fn test_from_options_reads_hidden_size() {
        let (model, optim) = configs::mini();
        let opt = WarmAdam::from_options(&optim, &model, ["w"]).unwrap();

        assert_eq!(opt.schedule().hidden_size(), model.hidden_size);
        assert_eq!(opt.schedule().warm_up(), optim.warm_up);
        assert_eq!(opt.optimizer().betas(), optim.betas);

        let bad = ModelOptions {
            hidden_size: 0,
            ..model
        };
        assert!(WarmAdam::from_options(&optim, &bad, ["w"]).is_err());
    }

    #[test]
    fn test_resume_from_saved_state() {
        let mut opt = WarmAdam::new(["w"], 2.0, 512, 4000, 0).unwrap();
        let mut w = Parameter::new("w", arr2(&[[0.5]]));
        for _ in 0..7 {
            opt.step(&mut [&mut w]);
        }

        let json = serde_json::to_string(&opt.state()).unwrap();
        let state: ScheduleState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, opt.state());

        let adam = Adam::new(vec![ParamGroup::new(2.0, ["w"])]);
        let mut resumed = WarmupOptimizer::resume(adam, noam(), state);
        assert_eq!(resumed.n_step(), 7);
        assert_eq!(resumed.lr(), noam().get_lr(7));

        let lr = resumed.step(&mut [&mut w]);
        assert_eq!(lr, noam().get_lr(8));
    }
}
