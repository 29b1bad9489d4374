use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::ReduceOp;
use crate::config::PrecisionConfig;
use crate::error::{Error, Result};
use crate::process_group::ProcessGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// Non-finite gradients; parameters untouched and the scale backed off.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f64,
    pub good_steps: u64,
}

/// Dynamic loss scaling for reduced-precision training.
///
/// Every rank runs its own scaler. Because the gradients it inspects have
/// already been all-reduced, the overflow verdict is the same everywhere and
/// the scales stay in lockstep without extra communication.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u64,
    good_steps: u64,
    min_scale: f64,
    enabled: bool,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            good_steps: 0,
            min_scale: 1.0,
            enabled: true,
        }
    }
}

impl GradScaler {
    pub fn from_config(config: &PrecisionConfig, enabled: bool) -> Self {
        Self {
            scale: if enabled { config.init_scale } else { 1.0 },
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval,
            good_steps: 0,
            min_scale: config.min_scale,
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self {
            scale: 1.0,
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_growth_interval(mut self, growth_interval: u64) -> Self {
        self.growth_interval = growth_interval.max(1);
        self
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn good_steps(&self) -> u64 {
        self.good_steps
    }

    pub fn state(&self) -> ScalerState {
        ScalerState {
            scale: self.scale,
            good_steps: self.good_steps,
        }
    }

    pub fn load_state(&mut self, state: ScalerState) {
        if !self.enabled {
            return;
        }
        self.scale = state.scale.max(self.min_scale);
        self.good_steps = state.good_steps;
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        Ok(loss.affine(self.scale, 0.0)?)
    }

    /// Unscales `grads`, then either applies the optimizer or skips the step.
    ///
    /// Non-finite gradients are always skipped. When disabled the scale is
    /// fixed at 1 and never backs off or grows.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O, grads: &mut GradStore, params: &[Var]) -> Result<StepOutcome> {
        let mut finite = true;
        for param in params {
            let Some(grad) = grads.get(param.as_tensor()) else {
                continue;
            };
            let unscaled = if self.enabled {
                grad.affine(1.0 / self.scale, 0.0)?
            } else {
                grad.clone()
            };
            // x - x is 0 for finite x and NaN for NaN or +-Inf.
            let residue = unscaled
                .sub(&unscaled)?
                .sum_all()?
                .to_dtype(DType::F32)?
                .to_scalar::<f32>()?;
            finite &= residue.is_finite();
            grads.insert(param.as_tensor(), unscaled);
        }

        if !finite && !self.enabled {
            warn!("⚠️  Non-finite gradients; skipping step");
            return Ok(StepOutcome::Skipped);
        }
        if !finite {
            self.good_steps = 0;
            let backed_off = (self.scale * self.backoff_factor).max(self.min_scale);
            warn!("⚠️  Non-finite gradients; skipping step, scale {} -> {}", self.scale, backed_off);
            self.scale = backed_off;
            return Ok(StepOutcome::Skipped);
        }

        optimizer.step(grads)?;
        if !self.enabled {
            return Ok(StepOutcome::Applied);
        }
        self.good_steps += 1;
        if self.good_steps >= self.growth_interval {
            let grown = self.scale * self.growth_factor;
            debug!("📈 Loss scale {} -> {}", self.scale, grown);
            self.scale = grown;
            self.good_steps = 0;
        }
        Ok(StepOutcome::Applied)
    }

    /// Confirms that every rank holds the same scale and growth counter.
    pub fn verify_agreement(&self, group: &ProcessGroup) -> Result<()> {
        let mine = [
            self.scale as f32,
            -(self.scale as f32),
            self.good_steps as f32,
            -(self.good_steps as f32),
        ];
        let reduced = group.all_reduce(&mine, ReduceOp::Max)?;
        let (max_scale, min_scale) = (reduced[0], -reduced[1]);
        let (max_good, min_good) = (reduced[2], -reduced[3]);
        if max_scale != min_scale || max_good != min_good {
            return Err(Error::ScaleDivergence(format!(
                "rank {} sees scale in [{}, {}] and good steps in [{}, {}]",
                group.rank(),
                min_scale,
                max_scale,
                min_good,
                max_good
            )));
        }
        Ok(())
    }
}
