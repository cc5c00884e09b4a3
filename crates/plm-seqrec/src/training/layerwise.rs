//! Per-layer learning-rate groups for the backbone.
//!
//! For `L` kept layers, layer `i` trains at `base_lr * layer_decay^(L - i)`,
//! so layers near the input move least. Embeddings share layer 0's rate and
//! other backbone parameters (final norm) share layer `L - 1`'s. Bias and
//! norm parameters never decay. Everything outside the backbone goes into one
//! flat `the_rest` group.

use std::collections::HashSet;

use crate::config::OptimConfig;
use crate::error::{SeqRecError, SeqRecResult};
use crate::params::{Param, ParamTag};

/// Name of the group holding every non-backbone parameter.
pub const REST_GROUP: &str = "the_rest";

/// Parameters sharing one learning rate and weight decay.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub name: String,
    pub params: Vec<Param>,
    pub lr: f64,
    pub weight_decay: f64,
}

impl ParamGroup {
    pub fn num_elements(&self) -> usize {
        self.params.iter().map(|p| p.num_elements()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerwiseOptimizerBuilder {
    base_lr: f64,
    layer_decay: f64,
    weight_decay: f64,
    rest_lr: f64,
    rest_weight_decay: f64,
}

impl LayerwiseOptimizerBuilder {
    pub fn new(
        base_lr: f64,
        layer_decay: f64,
        weight_decay: f64,
        rest_lr: f64,
        rest_weight_decay: f64,
    ) -> SeqRecResult<Self> {
        if layer_decay <= 0.0 {
            return Err(SeqRecError::config(format!(
                "layer_decay must be > 0, got {}",
                layer_decay
            )));
        }
        if base_lr < 0.0 || rest_lr < 0.0 {
            return Err(SeqRecError::config(format!(
                "learning rates must be >= 0 (base_lr={}, rest_lr={})",
                base_lr, rest_lr
            )));
        }
        if weight_decay < 0.0 || rest_weight_decay < 0.0 {
            return Err(SeqRecError::config("weight decay must be >= 0"));
        }
        Ok(Self {
            base_lr,
            layer_decay,
            weight_decay,
            rest_lr,
            rest_weight_decay,
        })
    }

    pub fn from_config(config: &OptimConfig) -> SeqRecResult<Self> {
        Self::new(
            config.plm_lr,
            config.plm_lr_layer_decay,
            config.plm_weight_decay,
            config.lr,
            config.weight_decay,
        )
    }

    /// `lr_i = base_lr * layer_decay^(L - i)` for `i` in `0..L`.
    pub fn layer_learning_rates(&self, num_layers: usize) -> Vec<f64> {
        (0..num_layers)
            .map(|i| self.base_lr * self.layer_decay.powi((num_layers - i) as i32))
            .collect()
    }

    /// Emit one group per trainable backbone parameter plus the rest group.
    ///
    /// `backbone` may contain frozen parameters; they are skipped. `rest`
    /// entries that are also in `backbone` are ignored.
    pub fn build(&self, num_layers: usize, backbone: &[&Param], rest: &[&Param]) -> SeqRecResult<Vec<ParamGroup>> {
        let lrs = self.layer_learning_rates(num_layers);
        let (first_lr, last_lr) = match (lrs.first(), lrs.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ if backbone.is_empty() => (self.base_lr, self.base_lr),
            _ => {
                return Err(SeqRecError::config(
                    "backbone parameters given but the window has no layers",
                ))
            }
        };

        let mut groups = Vec::new();
        for param in backbone.iter().filter(|p| p.is_trainable()) {
            let lr = match param.tag() {
                ParamTag::Layer(idx) => *lrs.get(idx).ok_or_else(|| {
                    SeqRecError::consistency(
                        format!("layer index of '{}'", param.name()),
                        num_layers,
                        idx + 1,
                    )
                })?,
                ParamTag::Embedding => first_lr,
                ParamTag::Other => last_lr,
            };
            let weight_decay = if param.decays() { self.weight_decay } else { 0.0 };
            tracing::debug!(
                "param group {}: lr={:.3e}, weight_decay={}",
                param.name(),
                lr,
                weight_decay
            );
            groups.push(ParamGroup {
                name: param.name().to_string(),
                params: vec![(*param).clone()],
                lr,
                weight_decay,
            });
        }
        let backbone_groups = groups.len();

        let backbone_ids: HashSet<_> = backbone.iter().map(|p| p.var().as_tensor().id()).collect();
        let rest_params: Vec<Param> = rest
            .iter()
            .filter(|p| p.is_trainable() && !backbone_ids.contains(&p.var().as_tensor().id()))
            .map(|p| (*p).clone())
            .collect();
        let rest_count = rest_params.len();
        if !rest_params.is_empty() {
            groups.push(ParamGroup {
                name: REST_GROUP.to_string(),
                params: rest_params,
                lr: self.rest_lr,
                weight_decay: self.rest_weight_decay,
            });
        }

        tracing::info!(
            "Optimizer groups: {} backbone (lr {:.3e}..={:.3e}), {} params at rest lr {:.3e}",
            backbone_groups,
            first_lr,
            last_lr,
            rest_count,
            self.rest_lr
        );
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Init, ParamRole};
    use candle_core::Device;

    fn param(name: &str, tag: ParamTag, role: ParamRole) -> Param {
        Param::initialized(name, &[2], Init::Zeros, tag, role, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_rates_follow_decay_formula() {
        let builder = LayerwiseOptimizerBuilder::new(1e-3, 0.5, 0.0, 1e-2, 0.0).unwrap();
        let lrs = builder.layer_learning_rates(3);
        assert_eq!(lrs, vec![1e-3 * 0.125, 1e-3 * 0.25, 1e-3 * 0.5]);
        assert!(lrs.windows(2).all(|w| w[0] < w[1]));
        assert!((lrs[2] / 0.5 - 1e-3).abs() < 1e-15);
    }

    #[test]
    fn test_unit_decay_is_flat() {
        let builder = LayerwiseOptimizerBuilder::new(2e-5, 1.0, 0.0, 1e-3, 0.0).unwrap();
        assert!(builder.layer_learning_rates(4).iter().all(|&lr| lr == 2e-5));
    }

    #[test]
    fn test_group_assignment() {
        let builder = LayerwiseOptimizerBuilder::new(1.0, 0.5, 0.1, 0.01, 0.2).unwrap();
        let emb = param("embed", ParamTag::Embedding, ParamRole::Weight);
        let w1 = param("l1.w", ParamTag::Layer(1), ParamRole::Weight);
        let b1 = param("l1.b", ParamTag::Layer(1), ParamRole::Bias);
        let norm = param("final.w", ParamTag::Other, ParamRole::Norm);
        let mut frozen = param("l0.w", ParamTag::Layer(0), ParamRole::Weight);
        frozen.set_trainable(false);
        let head = param("head.w", ParamTag::Other, ParamRole::Weight);

        let groups = builder
            .build(2, &[&emb, &frozen, &w1, &b1, &norm], &[&head, &w1])
            .unwrap();
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["embed", "l1.w", "l1.b", "final.w", REST_GROUP]);

        assert_eq!(groups[0].lr, 0.25);
        assert_eq!(groups[1].lr, 0.5);
        assert_eq!(groups[1].weight_decay, 0.1);
        assert_eq!(groups[2].weight_decay, 0.0);
        assert_eq!(groups[3].lr, 0.5);
        assert_eq!(groups[3].weight_decay, 0.0);

        let rest = &groups[4];
        assert_eq!(rest.params.len(), 1);
        assert_eq!(rest.lr, 0.01);
        assert_eq!(rest.weight_decay, 0.2);
    }

    #[test]
    fn test_empty_rest_group_omitted() {
        let builder = LayerwiseOptimizerBuilder::new(1.0, 0.5, 0.0, 0.01, 0.0).unwrap();
        let w = param("l0.w", ParamTag::Layer(0), ParamRole::Weight);
        let groups = builder.build(1, &[&w], &[]).unwrap();
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_layer_outside_window_is_consistency_error() {
        let builder = LayerwiseOptimizerBuilder::new(1.0, 0.5, 0.0, 0.01, 0.0).unwrap();
        let w = param("l5.w", ParamTag::Layer(5), ParamRole::Weight);
        assert!(builder.build(2, &[&w], &[]).unwrap_err().is_consistency());
    }

    #[test]
    fn test_invalid_hyperparameters() {
        assert!(LayerwiseOptimizerBuilder::new(1.0, 0.0, 0.0, 0.1, 0.0).unwrap_err().is_configuration());
        assert!(LayerwiseOptimizerBuilder::new(1.0, -0.5, 0.0, 0.1, 0.0).is_err());
        assert!(LayerwiseOptimizerBuilder::new(-1.0, 0.5, 0.0, 0.1, 0.0).is_err());
        assert!(LayerwiseOptimizerBuilder::new(1.0, 0.5, 0.0, -0.1, 0.0).is_err());
    }
}
