use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 1e-5,
        }
    }
}

struct Slot {
    name: String,
    var: Var,
    momentum: Option<Tensor>,
}

/// SGD with heavy-ball momentum and L2 weight decay.
///
/// Per parameter: `d = g + wd * p`, `buf = momentum * buf + d` (with
/// `buf = d` on the first step), `p -= lr * buf`.
pub struct MomentumSgd {
    slots: Vec<Slot>,
    config: SgdConfig,
}

impl MomentumSgd {
    pub fn with_names(params: Vec<(String, Var)>, config: SgdConfig) -> candle_core::Result<Self> {
        let slots = params
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| Slot {
                name,
                var,
                momentum: None,
            })
            .collect();
        Ok(Self { slots, config })
    }

    pub fn config(&self) -> SgdConfig {
        self.config
    }

    /// Momentum buffers that have been populated, keyed by parameter name.
    pub fn momentum_buffers(&self) -> HashMap<String, Tensor> {
        self.slots
            .iter()
            .filter_map(|s| s.momentum.as_ref().map(|m| (s.name.clone(), m.clone())))
            .collect()
    }

    /// Restores buffers by name; parameters absent from `buffers` start fresh.
    pub fn load_momentum_buffers(&mut self, buffers: &HashMap<String, Tensor>) -> candle_core::Result<()> {
        for slot in &mut self.slots {
            slot.momentum = match buffers.get(&slot.name) {
                Some(buf) => {
                    let target = slot.var.as_tensor();
                    if buf.shape() != target.shape() {
                        candle_core::bail!(
                            "momentum buffer {} has shape {:?}, parameter has {:?}",
                            slot.name,
                            buf.shape(),
                            target.shape()
                        );
                    }
                    Some(buf.to_device(target.device())?.to_dtype(target.dtype())?)
                }
                None => None,
            };
        }
        Ok(())
    }
}

impl Optimizer for MomentumSgd {
    type Config = SgdConfig;

    fn new(vars: Vec<Var>, config: SgdConfig) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (format!("param_{}", i), var))
            .collect();
        Self::with_names(named, config)
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let SgdConfig {
            learning_rate,
            momentum,
            weight_decay,
        } = self.config;

        for slot in &mut self.slots {
            let param = slot.var.as_tensor();
            let Some(grad) = grads.get(param) else {
                continue;
            };

            let mut d = grad.clone();
            if weight_decay != 0.0 {
                d = (d + (param * weight_decay)?)?;
            }
            if momentum != 0.0 {
                let buf = match &slot.momentum {
                    Some(prev) => ((prev * momentum)? + d)?,
                    None => d,
                }
                .detach();
                slot.momentum = Some(buf.clone());
                d = buf;
            }
            slot.var.set(&param.sub(&(d * learning_rate)?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar_problem(start: f32) -> (Var, MomentumSgd) {
        let w = Var::new(&[start], &Device::Cpu).unwrap();
        let config = SgdConfig {
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
        };
        let opt = MomentumSgd::with_names(vec![("w".into(), w.clone())], config).unwrap();
        (w, opt)
    }

    #[test]
    fn momentum_accumulates_across_steps() {
        let (w, mut opt) = scalar_problem(1.0);
        // loss = w^2 / 2, so the gradient equals w.
        for _ in 0..2 {
            let loss = (w.as_tensor().sqr().unwrap() * 0.5).unwrap().sum_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        // step 1: buf = 1.0, w = 0.9; step 2: buf = 0.9 * 1.0 + 0.9 = 1.8, w = 0.72
        let value = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((value - 0.72).abs() < 1e-6, "got {}", value);
        let buf = opt.momentum_buffers()["w"].to_vec1::<f32>().unwrap()[0];
        assert!((buf - 1.8).abs() < 1e-6);
    }

    #[test]
    fn weight_decay_pulls_towards_zero_without_gradient_signal() {
        let w = Var::new(&[2.0f32], &Device::Cpu).unwrap();
        let config = SgdConfig {
            learning_rate: 0.5,
            momentum: 0.0,
            weight_decay: 0.1,
        };
        let mut opt = MomentumSgd::new(vec![w.clone()], config).unwrap();
        let loss = (w.as_tensor() * 0.0).unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();
        let value = w.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((value - 1.9).abs() < 1e-6);
    }

    #[test]
    fn buffers_survive_export_and_import() {
        let (w, mut opt) = scalar_problem(1.0);
        let loss = (w.as_tensor().sqr().unwrap() * 0.5).unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();

        let (_, mut fresh) = scalar_problem(1.0);
        fresh.load_momentum_buffers(&opt.momentum_buffers()).unwrap();
        assert_eq!(
            fresh.momentum_buffers()["w"].to_vec1::<f32>().unwrap(),
            opt.momentum_buffers()["w"].to_vec1::<f32>().unwrap()
        );
    }
}
