use candle_core::Device;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Metal(usize),
    Cuda(usize), // device_id
    Cpu,
}

/// Owns the single accelerator assigned to this rank.
pub struct DeviceManager {
    device: Device,
    backend_type: BackendType,
}

impl DeviceManager {
    /// One process drives one device: rank `r` gets device ordinal `r`.
    pub fn for_rank(device_type: &str, local_rank: usize) -> Result<Self> {
        match device_type {
            "metal" => Self::new_metal(local_rank),
            "cuda" => Self::new_cuda(local_rank),
            "cpu" => Ok(Self::new_cpu()),
            _ => Err(Error::Config(format!("Unsupported backend type: {}", device_type))),
        }
    }

    fn new_metal(ordinal: usize) -> Result<Self> {
        debug!("Metal feature enabled: {}", cfg!(feature = "metal"));

        match Device::new_metal(ordinal) {
            Ok(device) => {
                info!("🖥️  Initialized Metal device {}", ordinal);
                Ok(Self {
                    device,
                    backend_type: BackendType::Metal(ordinal),
                })
            }
            Err(e) => {
                warn!("❌ Metal device creation failed: {}", e);
                warn!("📝 Falling back to CPU backend");
                Ok(Self::new_cpu())
            }
        }
    }

    fn new_cuda(ordinal: usize) -> Result<Self> {
        #[cfg(feature = "cuda")]
        {
            let device = Device::new_cuda(ordinal)?;
            info!("🚀 Initialized CUDA device {}", ordinal);
            Ok(Self {
                device,
                backend_type: BackendType::Cuda(ordinal),
            })
        }
        #[cfg(not(feature = "cuda"))]
        {
            Err(Error::Config(format!(
                "CUDA backend not available (requested cuda:{})",
                ordinal
            )))
        }
    }

    fn new_cpu() -> Self {
        debug!("💻 Using CPU backend");
        Self {
            device: Device::Cpu,
            backend_type: BackendType::Cpu,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Stable label recorded in checkpoint manifests, e.g. `cuda:1`.
    pub fn label(&self) -> String {
        match self.backend_type {
            BackendType::Metal(i) => format!("metal:{}", i),
            BackendType::Cuda(i) => format!("cuda:{}", i),
            BackendType::Cpu => "cpu".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    pub fn combine(self, acc: f32, value: f32) -> f32 {
        match self {
            ReduceOp::Sum => acc + value,
            ReduceOp::Max => acc.max(value),
            ReduceOp::Min => acc.min(value),
        }
    }

    pub fn combine_into(self, acc: &mut [f32], values: &[f32]) {
        for (a, &v) in acc.iter_mut().zip(values) {
            *a = self.combine(*a, v);
        }
    }
}

/// Collective operations provider.
///
/// Every call is a barrier: it returns only after all ranks have issued the
/// same call, and every rank must issue collectives in the same order.
pub trait CommunicationBackend: Send + Sync {
    fn name(&self) -> &str;
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    /// Reduces `data` element-wise across ranks; all ranks receive identical bits.
    fn all_reduce(&self, data: &[f32], op: ReduceOp) -> Result<Vec<f32>>;

    /// Delivers `src`'s payload to every rank. Non-source payloads are ignored.
    fn broadcast_bytes(&self, data: Vec<u8>, src: usize) -> Result<Vec<u8>>;
}

pub(crate) fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub(crate) fn bytes_to_f32s(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Transport(format!(
            "payload of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
