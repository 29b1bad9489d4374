use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::named_vars;

/// Seeds the device generator and switches accelerators to reproducible math.
///
/// The CPU backend has no seedable generator; that is not an error because
/// parameter initialization never draws from it (see [`reinitialize_parameters`]).
pub fn seed_everything(seed: u64, device: &Device) -> Result<()> {
    match device.set_seed(seed) {
        Ok(()) => debug!("🎲 Device RNG seeded with {}", seed),
        Err(e) => debug!("🎲 Device RNG not seedable ({}), host RNG only", e),
    }

    #[cfg(feature = "cuda")]
    if device.is_cuda() {
        candle_core::cuda::set_gemm_reduced_precision_f16(false);
        candle_core::cuda::set_gemm_reduced_precision_bf16(false);
        candle_core::cuda::set_gemm_reduced_precision_f32(false);
        debug!("🔒 Reduced-precision GEMM disabled");
    }

    Ok(())
}

/// Redraws every variable from a host RNG seeded with `seed`.
///
/// Variables are visited in sorted-name order, so replicas built from the same
/// architecture end up bit-identical on every rank and device. Weights get a
/// Kaiming-uniform draw with bound `1/sqrt(fan_in)`; biases are zeroed.
pub fn reinitialize_parameters(varmap: &VarMap, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let vars = named_vars(varmap)?;

    for (name, var) in &vars {
        let shape = var.as_tensor().shape().clone();
        let device = var.as_tensor().device().clone();
        let count = shape.elem_count();

        let values: Vec<f32> = if name.ends_with("bias") {
            vec![0.0; count]
        } else {
            let dims = shape.dims();
            let fan_in = match dims {
                [] => 1,
                [n] => *n,
                [out, ..] => count / (*out).max(1),
            }
            .max(1);
            let bound = 1.0 / (fan_in as f32).sqrt();
            (0..count).map(|_| rng.random_range(-bound..bound)).collect()
        };

        let fresh = Tensor::from_vec(values, shape, &device)?.to_dtype(var.as_tensor().dtype())?;
        var.set(&fresh)?;
    }

    info!("🌱 Initialized {} parameter tensors from seed {}", vars.len(), seed);
    Ok(())
}

/// MD5 over names, shapes, and f32 values of every variable.
pub fn parameter_fingerprint(varmap: &VarMap) -> Result<String> {
    let mut context = md5::Context::new();
    for (name, var) in named_vars(varmap)? {
        context.consume(name.as_bytes());
        for dim in var.as_tensor().dims() {
            context.consume((*dim as u64).to_le_bytes());
        }
        let values = var.as_tensor().to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        for v in values {
            context.consume(v.to_le_bytes());
        }
    }
    Ok(format!("{:x}", context.compute()))
}
