//! AdamW optimizer over [`ParamGroup`]s.
//!
//! Implements AdamW with:
//! - Per-parameter moment estimates (m, v)
//! - Per-group learning rate and weight decay
//! - Optional global gradient clipping (max_norm)
//! - Decoupled weight decay

use candle_core::{backprop::GradStore, Tensor, Var};

use crate::config::OptimConfig;
use crate::error::{SeqRecError, SeqRecResult};

use super::layerwise::ParamGroup;

/// Moment and clipping settings shared by every group.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamWConfig {
    /// First moment exponential decay rate.
    pub beta1: f64,
    /// Second moment exponential decay rate.
    pub beta2: f64,
    /// Numerical stability constant.
    pub epsilon: f64,
    /// Maximum global gradient norm; `None` disables clipping.
    pub max_grad_norm: Option<f64>,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            max_grad_norm: None,
        }
    }
}

impl From<&OptimConfig> for AdamWConfig {
    fn from(config: &OptimConfig) -> Self {
        Self {
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.eps,
            max_grad_norm: config.max_grad_norm,
        }
    }
}

/// A tracked parameter with its moment estimates.
struct TrackedParam {
    var: Var,
    m: Tensor,
    v: Tensor,
    /// Index into `AdamW::groups`.
    group: usize,
}

/// Learning rate and weight decay of one group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSettings {
    pub name: String,
    pub lr: f64,
    pub weight_decay: f64,
}

pub struct AdamW {
    config: AdamWConfig,
    groups: Vec<GroupSettings>,
    params: Vec<TrackedParam>,
    /// Global step counter (for bias correction).
    step: usize,
}

impl AdamW {
    /// Track every parameter of every group.
    pub fn new(groups: Vec<ParamGroup>, config: AdamWConfig) -> SeqRecResult<Self> {
        let mut settings = Vec::with_capacity(groups.len());
        let mut params = Vec::new();
        for (idx, group) in groups.into_iter().enumerate() {
            for param in group.params {
                let var = param.var().clone();
                let m = var.as_tensor().zeros_like().map_err(map_candle)?;
                let v = var.as_tensor().zeros_like().map_err(map_candle)?;
                params.push(TrackedParam { var, m, v, group: idx });
            }
            settings.push(GroupSettings {
                name: group.name,
                lr: group.lr,
                weight_decay: group.weight_decay,
            });
        }

        tracing::debug!(
            "AdamW tracking {} tensors in {} groups",
            params.len(),
            settings.len()
        );

        Ok(Self {
            config,
            groups: settings,
            params,
            step: 0,
        })
    }

    /// Backpropagate `loss` and update every tracked parameter.
    pub fn step(&mut self, loss: &Tensor) -> SeqRecResult<()> {
        let grads = loss.backward().map_err(map_candle)?;
        self.step_with_grads(&grads)
    }

    /// Update every tracked parameter from precomputed gradients.
    pub fn step_with_grads(&mut self, grads: &GradStore) -> SeqRecResult<()> {
        self.step += 1;
        let t = self.step as i32;

        let clip_scale = match self.config.max_grad_norm {
            Some(max_norm) => {
                let total_norm = self.grad_norm(grads)?;
                if total_norm > max_norm {
                    max_norm / (total_norm + self.config.epsilon)
                } else {
                    1.0
                }
            }
            None => 1.0,
        };

        let bc1 = 1.0 - self.config.beta1.powi(t);
        let bc2 = 1.0 - self.config.beta2.powi(t);

        for param in &mut self.params {
            let grad = match grads.get(param.var.as_tensor()) {
                Some(g) => g,
                None => continue,
            };
            let GroupSettings { lr, weight_decay, .. } = self.groups[param.group];

            let grad = if (clip_scale - 1.0).abs() > 1e-9 {
                grad.affine(clip_scale, 0.0).map_err(map_candle)?
            } else {
                grad.clone()
            };

            // m = b1 * m + (1 - b1) * g
            param.m = param
                .m
                .affine(self.config.beta1, 0.0)
                .map_err(map_candle)?
                .add(&grad.affine(1.0 - self.config.beta1, 0.0).map_err(map_candle)?)
                .map_err(map_candle)?
                .detach();

            // v = b2 * v + (1 - b2) * g^2
            param.v = param
                .v
                .affine(self.config.beta2, 0.0)
                .map_err(map_candle)?
                .add(
                    &grad
                        .sqr()
                        .map_err(map_candle)?
                        .affine(1.0 - self.config.beta2, 0.0)
                        .map_err(map_candle)?,
                )
                .map_err(map_candle)?
                .detach();

            let m_hat = param.m.affine(1.0 / bc1, 0.0).map_err(map_candle)?;
            let denom = param
                .v
                .affine(1.0 / bc2, 0.0)
                .map_err(map_candle)?
                .sqrt()
                .map_err(map_candle)?
                .affine(1.0, self.config.epsilon)
                .map_err(map_candle)?;
            let update = m_hat.div(&denom).map_err(map_candle)?.affine(-lr, 0.0).map_err(map_candle)?;

            // theta = theta * (1 - lr * wd) + update
            let new_val = param
                .var
                .as_tensor()
                .affine(1.0 - lr * weight_decay, 0.0)
                .map_err(map_candle)?
                .add(&update)
                .map_err(map_candle)?
                .detach();
            param.var.set(&new_val).map_err(map_candle)?;
        }

        Ok(())
    }

    fn grad_norm(&self, grads: &GradStore) -> SeqRecResult<f64> {
        let mut total_sq = 0.0f64;
        for param in &self.params {
            if let Some(grad) = grads.get(param.var.as_tensor()) {
                let sq: f32 = grad
                    .sqr()
                    .map_err(map_candle)?
                    .sum_all()
                    .map_err(map_candle)?
                    .to_scalar()
                    .map_err(map_candle)?;
                total_sq += sq as f64;
            }
        }
        Ok(total_sq.sqrt())
    }

    pub fn global_step(&self) -> usize {
        self.step
    }

    /// Number of tracked tensors.
    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn groups(&self) -> &[GroupSettings] {
        &self.groups
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("Optimizer error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Init, Param, ParamRole, ParamTag};
    use candle_core::Device;

    fn param(name: &str, value: f32) -> Param {
        let tensor = Tensor::full(value, 3, &Device::Cpu).unwrap();
        Param::from_tensor(name, &tensor, ParamTag::Other, ParamRole::Weight).unwrap()
    }

    fn values(p: &Param) -> Vec<f32> {
        p.var().as_tensor().to_vec1().unwrap()
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        let p = param("w", 1.0);
        let group = ParamGroup {
            name: "w".into(),
            params: vec![p.clone()],
            lr: 0.1,
            weight_decay: 0.0,
        };
        let mut opt = AdamW::new(vec![group], AdamWConfig::default()).unwrap();

        // d/dw sum(w) = 1 everywhere; bias-corrected Adam step is lr * sign(g)
        let loss = p.tensor().sum_all().unwrap();
        opt.step(&loss).unwrap();

        assert_eq!(opt.global_step(), 1);
        assert!(values(&p).iter().all(|v| (v - 0.9).abs() < 1e-5));
    }

    #[test]
    fn test_weight_decay_is_decoupled_and_per_group() {
        let decayed = param("decayed", 1.0);
        let plain = param("plain", 1.0);
        let groups = vec![
            ParamGroup { name: "decayed".into(), params: vec![decayed.clone()], lr: 0.1, weight_decay: 0.5 },
            ParamGroup { name: "plain".into(), params: vec![plain.clone()], lr: 0.1, weight_decay: 0.0 },
        ];
        let mut opt = AdamW::new(groups, AdamWConfig::default()).unwrap();
        let loss = (decayed.tensor().sum_all().unwrap() + plain.tensor().sum_all().unwrap()).unwrap();
        opt.step(&loss).unwrap();

        // 1 * (1 - 0.05) - 0.1
        assert!(values(&decayed).iter().all(|v| (v - 0.85).abs() < 1e-5));
        assert!(values(&plain).iter().all(|v| (v - 0.9).abs() < 1e-5));
    }

    #[test]
    fn test_untracked_params_untouched() {
        let tracked = param("tracked", 1.0);
        let mut frozen = Param::initialized("frozen", &[3], Init::Ones, ParamTag::Layer(0), ParamRole::Weight, &Device::Cpu).unwrap();
        frozen.set_trainable(false);

        let group = ParamGroup { name: "tracked".into(), params: vec![tracked.clone()], lr: 0.1, weight_decay: 0.0 };
        let mut opt = AdamW::new(vec![group], AdamWConfig::default()).unwrap();
        let loss = tracked
            .tensor()
            .mul(&frozen.tensor())
            .unwrap()
            .sum_all()
            .unwrap();
        opt.step(&loss).unwrap();

        assert_eq!(values(&frozen), vec![1.0, 1.0, 1.0]);
        assert_ne!(values(&tracked), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_clipping_scales_gradient() {
        let p = param("w", 0.0);
        let group = ParamGroup { name: "w".into(), params: vec![p.clone()], lr: 0.1, weight_decay: 0.0 };
        let config = AdamWConfig { max_grad_norm: Some(1e-3), ..Default::default() };
        let mut opt = AdamW::new(vec![group], config).unwrap();

        // Adam normalises magnitude, so the step stays ~lr even when clipped
        let loss = p.tensor().affine(100.0, 0.0).unwrap().sum_all().unwrap();
        opt.step(&loss).unwrap();
        assert!(values(&p).iter().all(|v| (v + 0.1).abs() < 1e-3));
    }

    #[test]
    fn test_group_settings_exposed() {
        let group = ParamGroup { name: "the_rest".into(), params: vec![param("a", 0.0), param("b", 0.0)], lr: 1e-3, weight_decay: 0.01 };
        let opt = AdamW::new(vec![group], AdamWConfig::default()).unwrap();
        assert_eq!(opt.num_params(), 2);
        assert_eq!(opt.groups()[0].name, "the_rest");
        assert_eq!(opt.groups()[0].lr, 1e-3);
    }
}
