use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub training: TrainingConfig,
    pub distributed: DistributedConfig,
    pub precision: PrecisionConfig,
    pub checkpoint: CheckpointConfig,
    pub data: DataConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub num_epochs: usize,
    pub batch_size: usize,            // per process
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub random_seed: u64,
    pub model_type: String,           // "convnet", "mlp"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    pub local_rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub device_type: String,          // "cpu", "cuda", "metal"
    pub bucket_cap_mb: f64,
    pub init_timeout_secs: u64,
    pub collective_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecisionConfig {
    pub dtype: String,                // "f32", "f16", "bf16"
    pub init_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: u64,
    pub min_scale: f64,
    pub scale_check_interval: u64,    // 0 disables the cross-rank check
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub model_dir: PathBuf,
    pub model_filename: String,
    pub resume: bool,
    pub eval_every: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub dataset: String,              // "synthetic", "cifar10"
    pub data_dir: PathBuf,
    pub eval_batch_size: usize,
    pub prefetch: usize,
    pub augment: bool,                // random crop + flip on training batches
    pub synthetic_train_size: usize,
    pub synthetic_test_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub restart_interval_ms: u64,
    pub failure_backoff_ms: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self::default_for_device("cpu")
    }
}

impl TrainConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: TrainConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn default_for_device(device_type: &str) -> Self {
        // Reduced precision only pays off on accelerators.
        let dtype = if device_type == "cpu" { "f32" } else { "f16" };

        Self {
            training: TrainingConfig {
                num_epochs: 3,
                batch_size: 256,
                learning_rate: 0.1,
                momentum: 0.9,
                weight_decay: 1e-5,
                random_seed: 0,
                model_type: "convnet".to_string(),
            },
            distributed: DistributedConfig {
                local_rank: 0,
                world_size: 1,
                master_addr: "127.0.0.1".to_string(),
                master_port: 29500,
                device_type: device_type.to_string(),
                bucket_cap_mb: 25.0,
                init_timeout_secs: 60,
                collective_timeout_secs: 300,
            },
            precision: PrecisionConfig {
                dtype: dtype.to_string(),
                init_scale: 65536.0,
                growth_factor: 2.0,
                backoff_factor: 0.5,
                growth_interval: 2000,
                min_scale: 1.0,
                scale_check_interval: 0,
            },
            checkpoint: CheckpointConfig {
                model_dir: PathBuf::from("saved_models"),
                model_filename: "replica.safetensors".to_string(),
                resume: false,
                eval_every: 10,
            },
            data: DataConfig {
                dataset: "synthetic".to_string(),
                data_dir: PathBuf::from("data/cifar-10-batches-bin"),
                eval_batch_size: 128,
                prefetch: 2,
                augment: false,
                synthetic_train_size: 2048,
                synthetic_test_size: 512,
            },
            supervisor: SupervisorConfig {
                restart_interval_ms: 1000,
                failure_backoff_ms: 5000,
            },
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint.model_dir.join(&self.checkpoint.model_filename)
    }

    pub fn compute_dtype(&self) -> Result<DType> {
        match self.precision.dtype.as_str() {
            "f32" => Ok(DType::F32),
            "f16" => Ok(DType::F16),
            "bf16" => Ok(DType::BF16),
            other => Err(Error::Config(format!("unsupported compute dtype: {}", other))),
        }
    }

    /// Loss scaling is only needed when gradients flow through half precision.
    pub fn loss_scaling_enabled(&self) -> bool {
        self.precision.dtype != "f32"
    }

    pub fn bucket_cap_bytes(&self) -> usize {
        (self.distributed.bucket_cap_mb * 1024.0 * 1024.0) as usize
    }

    pub fn collective_timeout(&self) -> Duration {
        Duration::from_secs(self.distributed.collective_timeout_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.distributed.init_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let dist = &self.distributed;
        if dist.world_size == 0 {
            return Err(Error::Config("world size must be at least 1".into()));
        }
        if dist.local_rank >= dist.world_size {
            return Err(Error::Config(format!(
                "local rank {} out of range for world size {}",
                dist.local_rank, dist.world_size
            )));
        }
        if self.training.batch_size == 0 || self.data.eval_batch_size == 0 {
            return Err(Error::Config("batch sizes must be greater than zero".into()));
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(Error::Config("learning rate must be positive".into()));
        }
        if self.checkpoint.eval_every == 0 {
            return Err(Error::Config("evaluation cadence must be at least 1 epoch".into()));
        }
        if self.checkpoint.model_filename.is_empty() {
            return Err(Error::Config("checkpoint filename must not be empty".into()));
        }
        if dist.bucket_cap_mb <= 0.0 {
            return Err(Error::Config("bucket cap must be positive".into()));
        }

        let precision = &self.precision;
        self.compute_dtype()?;
        if precision.growth_factor <= 1.0 {
            return Err(Error::Config("growth factor must be greater than 1".into()));
        }
        if !(precision.backoff_factor > 0.0 && precision.backoff_factor < 1.0) {
            return Err(Error::Config("backoff factor must lie in (0, 1)".into()));
        }
        if precision.growth_interval == 0 {
            return Err(Error::Config("growth interval must be at least 1 step".into()));
        }
        if precision.min_scale <= 0.0 || precision.init_scale < precision.min_scale {
            return Err(Error::Config("initial scale must be at least the minimum scale".into()));
        }

        match self.data.dataset.as_str() {
            "synthetic" => {
                if self.data.synthetic_train_size == 0 || self.data.synthetic_test_size == 0 {
                    return Err(Error::Config("synthetic dataset sizes must be positive".into()));
                }
            }
            "cifar10" => {}
            other => return Err(Error::Config(format!("unknown dataset: {}", other))),
        }

        match dist.device_type.as_str() {
            "cpu" | "cuda" | "metal" => Ok(()),
            other => Err(Error::Config(format!("unsupported device type: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TrainConfig::default();
        config.validate().unwrap();
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.training.batch_size, 256);
        assert_eq!(config.checkpoint.eval_every, 10);
        assert!(!config.loss_scaling_enabled());
    }

    #[test]
    fn accelerator_defaults_enable_loss_scaling() {
        let config = TrainConfig::default_for_device("cuda");
        assert_eq!(config.compute_dtype().unwrap(), DType::F16);
        assert!(config.loss_scaling_enabled());
    }

    #[test]
    fn rank_outside_world_is_rejected() {
        let mut config = TrainConfig::default();
        config.distributed.world_size = 2;
        config.distributed.local_rank = 2;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn invalid_backoff_is_rejected() {
        let mut config = TrainConfig::default();
        config.precision.backoff_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");

        let mut config = TrainConfig::default();
        config.training.num_epochs = 25;
        config.checkpoint.resume = true;
        config.save(&path).unwrap();

        let loaded = TrainConfig::load(&path).unwrap();
        assert_eq!(loaded.training.num_epochs, 25);
        assert!(loaded.checkpoint.resume);
        assert_eq!(loaded.checkpoint_path(), PathBuf::from("saved_models/replica.safetensors"));
    }
}
