use candle_core::{Device, Tensor, Var};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::optim::{MomentumSgd, SgdConfig};
use crate::process_group::{ProcessGroup, COORDINATOR};
use crate::scaler::{GradScaler, ScalerState};

pub const FORMAT_VERSION: u32 = 1;

const MODEL_PREFIX: &str = "model.";
const OPTIM_PREFIX: &str = "optim.";

const STATUS_OK: u8 = 0;
const STATUS_ABSENT: u8 = 1;
const STATUS_ERROR: u8 = 2;
const STATUS_INVALID: u8 = 3;

const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Everything besides the tensors, stored next to them as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub model: String,
    pub next_epoch: usize,
    pub global_step: u64,
    pub scaler: ScalerState,
    pub optimizer: SgdConfig,
    pub world_size: usize,
    pub saved_at: DateTime<Utc>,
    /// MD5 of the tensor file.
    pub tensors_md5: String,
}

/// Where training stood when a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub next_epoch: usize,
    pub global_step: u64,
}

/// Parameters, momentum buffers, and the manifest describing them.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub manifest: Manifest,
    pub params: HashMap<String, Tensor>,
    pub momentum: HashMap<String, Tensor>,
}

impl Snapshot {
    /// Deep-copies the current state so later updates cannot leak in.
    pub fn capture(
        model_name: &str,
        params: &[(String, Var)],
        optimizer: &MomentumSgd,
        scaler: &GradScaler,
        progress: Progress,
        world_size: usize,
    ) -> Result<Self> {
        let params = params
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        let momentum = optimizer
            .momentum_buffers()
            .into_iter()
            .map(|(name, buf)| Ok((name, buf.copy()?)))
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            manifest: Manifest {
                version: FORMAT_VERSION,
                model: model_name.to_string(),
                next_epoch: progress.next_epoch,
                global_step: progress.global_step,
                scaler: scaler.state(),
                optimizer: optimizer.config(),
                world_size,
                saved_at: Utc::now(),
                tensors_md5: String::new(),
            },
            params,
            momentum,
        })
    }

    pub fn progress(&self) -> Progress {
        Progress {
            next_epoch: self.manifest.next_epoch,
            global_step: self.manifest.global_step,
        }
    }

    /// Restores parameters, momentum buffers, and scaler state.
    pub fn apply(&self, params: &[(String, Var)], optimizer: &mut MomentumSgd, scaler: &mut GradScaler) -> Result<()> {
        for (name, var) in params {
            let stored = self
                .params
                .get(name)
                .ok_or_else(|| Error::InvalidCheckpoint(format!("checkpoint has no parameter {}", name)))?;
            let target = var.as_tensor();
            if stored.shape() != target.shape() {
                return Err(Error::InvalidCheckpoint(format!(
                    "parameter {} stored as {:?}, model expects {:?}",
                    name,
                    stored.shape(),
                    target.shape()
                )));
            }
            var.set(&stored.to_device(target.device())?.to_dtype(target.dtype())?)?;
        }
        optimizer
            .load_momentum_buffers(&self.momentum)
            .map_err(|e| Error::InvalidCheckpoint(e.to_string()))?;
        scaler.load_state(self.manifest.scaler);
        Ok(())
    }

    fn tensors(&self) -> HashMap<String, Tensor> {
        let params = self.params.iter().map(|(k, v)| (format!("{}{}", MODEL_PREFIX, k), v.clone()));
        let momentum = self.momentum.iter().map(|(k, v)| (format!("{}{}", OPTIM_PREFIX, k), v.clone()));
        params.chain(momentum).collect()
    }
}

/// Single-writer, broadcast-reader checkpoint store.
///
/// The manifest lives beside the tensor file as `<filename>.manifest.json`,
/// so the two paths differ for every filename.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    tensors_path: PathBuf,
    manifest_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl AsRef<Path>, filename: &str) -> Self {
        let tensors_path = dir.as_ref().join(filename);
        let mut manifest_name = tensors_path.as_os_str().to_owned();
        manifest_name.push(MANIFEST_SUFFIX);
        let manifest_path = PathBuf::from(manifest_name);
        Self {
            tensors_path,
            manifest_path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.tensors_path
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Writes the snapshot from the coordinator; other ranks return `false`
    /// without touching the filesystem.
    ///
    /// Both files are written beside their targets and renamed into place.
    /// The manifest is renamed last, so a crash in between leaves a digest
    /// mismatch that `load` reports instead of half-written tensors.
    pub fn save(&self, group: &ProcessGroup, snapshot: &Snapshot) -> Result<bool> {
        if group.rank() != COORDINATOR {
            return Ok(false);
        }

        let dir = self.tensors_path.parent().unwrap_or_else(|| Path::new("."));
        if !dir.as_os_str().is_empty() && !dir.is_dir() {
            return Err(Error::Checkpoint(format!(
                "checkpoint directory {} does not exist",
                dir.display()
            )));
        }

        let tensors_tmp = with_tmp_suffix(&self.tensors_path);
        candle_core::safetensors::save(&snapshot.tensors(), &tensors_tmp)?;
        let digest = format!("{:x}", md5::compute(fs::read(&tensors_tmp)?));

        let mut manifest = snapshot.manifest.clone();
        manifest.tensors_md5 = digest;
        let manifest_tmp = with_tmp_suffix(&self.manifest_path);
        fs::write(&manifest_tmp, serde_json::to_vec_pretty(&manifest)?)?;

        fs::rename(&tensors_tmp, &self.tensors_path)?;
        fs::rename(&manifest_tmp, &self.manifest_path)?;

        info!(
            "💾 Saved checkpoint to {} (next epoch {}, step {})",
            self.tensors_path.display(),
            manifest.next_epoch,
            manifest.global_step
        );
        Ok(true)
    }

    /// Coordinator reads and verifies the files once and broadcasts them;
    /// every rank materializes the tensors on its own `device`.
    ///
    /// Returns `None` on every rank when no checkpoint exists. A file that
    /// cannot be read right now is a retryable [`Error::Checkpoint`]; one that
    /// will never verify is a fatal [`Error::InvalidCheckpoint`].
    pub fn load(&self, group: &ProcessGroup, device: &Device) -> Result<Option<Snapshot>> {
        let payload = if group.rank() == COORDINATOR {
            self.read_payload()
        } else {
            Vec::new()
        };
        let payload = group.broadcast_bytes(payload, COORDINATOR)?;

        let (&status, body) = payload
            .split_first()
            .ok_or_else(|| Error::InvalidCheckpoint("empty checkpoint broadcast".into()))?;
        match status {
            STATUS_OK => {}
            STATUS_ABSENT => {
                warn!(
                    "📭 Rank {}: no checkpoint at {}, starting fresh",
                    group.rank(),
                    self.tensors_path.display()
                );
                return Ok(None);
            }
            STATUS_ERROR => {
                return Err(Error::Checkpoint(String::from_utf8_lossy(body).into_owned()));
            }
            _ => {
                return Err(Error::InvalidCheckpoint(String::from_utf8_lossy(body).into_owned()));
            }
        }

        if body.len() < 8 {
            return Err(Error::InvalidCheckpoint("truncated checkpoint broadcast".into()));
        }
        let (len, rest) = body.split_at(8);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(len);
        let manifest_len = u64::from_le_bytes(len_bytes) as usize;
        if rest.len() < manifest_len {
            return Err(Error::InvalidCheckpoint("truncated checkpoint manifest".into()));
        }
        let (manifest_bytes, tensor_bytes) = rest.split_at(manifest_len);
        let manifest: Manifest = serde_json::from_slice(manifest_bytes)
            .map_err(|e| Error::InvalidCheckpoint(format!("unreadable manifest: {}", e)))?;

        let tensors = candle_core::safetensors::load_buffer(tensor_bytes, device)
            .map_err(|e| Error::InvalidCheckpoint(format!("undecodable tensors: {}", e)))?;
        let mut params = HashMap::new();
        let mut momentum = HashMap::new();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(MODEL_PREFIX) {
                params.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(OPTIM_PREFIX) {
                momentum.insert(name.to_string(), tensor);
            } else {
                debug!("ignoring unknown checkpoint entry {}", key);
            }
        }

        if manifest.world_size != group.world_size() {
            info!(
                "🔁 Checkpoint written by {} ranks, resuming with {}",
                manifest.world_size,
                group.world_size()
            );
        }
        info!(
            "📂 Rank {}: loaded checkpoint (next epoch {}, step {}, {} tensors)",
            group.rank(),
            manifest.next_epoch,
            manifest.global_step,
            params.len() + momentum.len()
        );

        Ok(Some(Snapshot {
            manifest,
            params,
            momentum,
        }))
    }

    /// Status byte followed by `[manifest len][manifest][tensors]` or an
    /// error message. Never fails, so the broadcast always happens.
    fn read_payload(&self) -> Vec<u8> {
        if !self.tensors_path.exists() && !self.manifest_path.exists() {
            return vec![STATUS_ABSENT];
        }
        match self.read_verified() {
            Ok((manifest, tensors)) => {
                let mut payload = Vec::with_capacity(9 + manifest.len() + tensors.len());
                payload.push(STATUS_OK);
                payload.extend_from_slice(&(manifest.len() as u64).to_le_bytes());
                payload.extend_from_slice(&manifest);
                payload.extend_from_slice(&tensors);
                payload
            }
            Err(e) => {
                warn!("❌ Checkpoint at {} is unusable: {}", self.tensors_path.display(), e);
                let status = if e.is_retryable() { STATUS_ERROR } else { STATUS_INVALID };
                let mut payload = vec![status];
                payload.extend_from_slice(e.to_string().as_bytes());
                payload
            }
        }
    }

    fn read_verified(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        // A save interrupted between the two renames leaves one file alone.
        for (path, other) in [(&self.manifest_path, &self.tensors_path), (&self.tensors_path, &self.manifest_path)] {
            if !path.exists() {
                return Err(Error::InvalidCheckpoint(format!(
                    "{} exists without {}",
                    other.display(),
                    path.display()
                )));
            }
        }
        let manifest_bytes = fs::read(&self.manifest_path)?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| Error::InvalidCheckpoint(format!("unreadable manifest: {}", e)))?;
        if manifest.version != FORMAT_VERSION {
            return Err(Error::InvalidCheckpoint(format!(
                "unsupported checkpoint version {}",
                manifest.version
            )));
        }

        let tensors = fs::read(&self.tensors_path)?;
        let digest = format!("{:x}", md5::compute(&tensors));
        if digest != manifest.tensors_md5 {
            return Err(Error::InvalidCheckpoint(format!(
                "digest mismatch: manifest says {}, file hashes to {}",
                manifest.tensors_md5, digest
            )));
        }
        Ok((manifest_bytes, tensors))
    }
}

fn with_tmp_suffix(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Mlp, ReplicaModel};
    use crate::seed::{parameter_fingerprint, reinitialize_parameters};
    use candle_nn::Optimizer;
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        model: Mlp,
        optimizer: MomentumSgd,
        scaler: GradScaler,
    }

    fn fixture(seed: u64) -> Fixture {
        let model = Mlp::new(6, &[4], 3, &Device::Cpu).unwrap();
        reinitialize_parameters(model.varmap(), seed).unwrap();
        let optimizer = MomentumSgd::with_names(model.named_parameters().unwrap(), SgdConfig::default()).unwrap();
        Fixture {
            model,
            optimizer,
            scaler: GradScaler::default(),
        }
    }

    fn train_one_step(f: &mut Fixture) {
        let input = Tensor::new(&[[0.5f32, -1.0, 0.25, 2.0, 0.0, 1.0]], &Device::Cpu).unwrap();
        let loss = f.model.forward(&input, candle_core::DType::F32).unwrap().sqr().unwrap().sum_all().unwrap();
        f.optimizer.backward_step(&loss).unwrap();
    }

    fn snapshot_of(f: &Fixture, next_epoch: usize) -> Snapshot {
        Snapshot::capture(
            f.model.name(),
            &f.model.named_parameters().unwrap(),
            &f.optimizer,
            &f.scaler,
            Progress {
                next_epoch,
                global_step: 42,
            },
            1,
        )
        .unwrap()
    }

    #[test]
    fn save_then_load_restores_full_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "replica.safetensors");
        let group = ProcessGroup::local(1, Duration::from_secs(1)).pop().unwrap();

        let mut original = fixture(1);
        train_one_step(&mut original);
        original.scaler.load_state(ScalerState {
            scale: 1024.0,
            good_steps: 7,
        });
        assert!(manager.save(&group, &snapshot_of(&original, 5)).unwrap());
        assert!(manager.manifest_path().exists());

        let mut restored = fixture(2);
        let snapshot = manager.load(&group, &Device::Cpu).unwrap().unwrap();
        snapshot
            .apply(&restored.model.named_parameters().unwrap(), &mut restored.optimizer, &mut restored.scaler)
            .unwrap();

        assert_eq!(
            parameter_fingerprint(original.model.varmap()).unwrap(),
            parameter_fingerprint(restored.model.varmap()).unwrap()
        );
        assert_eq!(snapshot.progress(), Progress { next_epoch: 5, global_step: 42 });
        assert_eq!(restored.scaler.state(), original.scaler.state());
        assert_eq!(
            restored.optimizer.momentum_buffers().len(),
            original.optimizer.momentum_buffers().len()
        );

        // The restored optimizer continues exactly where the original left off.
        train_one_step(&mut original);
        train_one_step(&mut restored);
        assert_eq!(
            parameter_fingerprint(original.model.varmap()).unwrap(),
            parameter_fingerprint(restored.model.varmap()).unwrap()
        );
    }

    #[test]
    fn missing_checkpoint_means_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "absent.safetensors");
        let group = ProcessGroup::local(1, Duration::from_secs(1)).pop().unwrap();
        assert!(manager.load(&group, &Device::Cpu).unwrap().is_none());
    }

    #[test]
    fn corrupted_tensors_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "replica.safetensors");
        let group = ProcessGroup::local(1, Duration::from_secs(1)).pop().unwrap();
        manager.save(&group, &snapshot_of(&fixture(3), 1)).unwrap();

        let mut bytes = fs::read(manager.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(manager.path(), bytes).unwrap();

        let err = manager.load(&group, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::InvalidCheckpoint(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn tensors_without_manifest_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "replica.safetensors");
        let group = ProcessGroup::local(1, Duration::from_secs(1)).pop().unwrap();
        manager.save(&group, &snapshot_of(&fixture(3), 1)).unwrap();
        fs::remove_file(manager.manifest_path()).unwrap();

        let err = manager.load(&group, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::InvalidCheckpoint(_)));
    }

    #[test]
    fn json_filename_keeps_manifest_separate() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "ckpt.json");
        assert_ne!(manager.path(), manager.manifest_path());
        assert_eq!(manager.manifest_path(), dir.path().join("ckpt.json.manifest.json"));

        let group = ProcessGroup::local(1, Duration::from_secs(1)).pop().unwrap();
        let f = fixture(4);
        assert!(manager.save(&group, &snapshot_of(&f, 2)).unwrap());
        let snapshot = manager.load(&group, &Device::Cpu).unwrap().unwrap();
        assert_eq!(snapshot.progress().next_epoch, 2);
        assert_eq!(snapshot.params.len(), f.model.named_parameters().unwrap().len());
    }

    #[test]
    fn save_requires_an_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().join("missing"), "replica.safetensors");
        let group = ProcessGroup::local(1, Duration::from_secs(1)).pop().unwrap();
        let err = manager.save(&group, &snapshot_of(&fixture(3), 1)).unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));
    }

    #[test]
    fn only_the_coordinator_writes_and_everyone_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let handles: Vec<_> = ProcessGroup::local(3, Duration::from_secs(10))
            .into_iter()
            .map(|group| {
                let path = path.clone();
                thread::spawn(move || {
                    let manager = CheckpointManager::new(&path, "replica.safetensors");
                    let f = fixture(9);
                    let wrote = manager.save(&group, &snapshot_of(&f, 3)).unwrap();
                    group.barrier().unwrap();

                    let mut other = fixture(100 + group.rank() as u64);
                    let snapshot = manager.load(&group, &Device::Cpu).unwrap().unwrap();
                    snapshot
                        .apply(&other.model.named_parameters().unwrap(), &mut other.optimizer, &mut other.scaler)
                        .unwrap();
                    (wrote, parameter_fingerprint(other.model.varmap()).unwrap())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(wrote, _)| *wrote).count(), 1);
        assert!(results[0].0);
        assert!(results.iter().all(|(_, fp)| *fp == results[0].1));
    }

    #[test]
    fn corrupt_checkpoint_fails_every_rank() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("replica.safetensors"), b"not a tensor file").unwrap();
        fs::write(dir.path().join("replica.safetensors.manifest.json"), b"{}").unwrap();
        let path = dir.path().to_path_buf();

        let handles: Vec<_> = ProcessGroup::local(2, Duration::from_secs(10))
            .into_iter()
            .map(|group| {
                let path = path.clone();
                thread::spawn(move || {
                    CheckpointManager::new(&path, "replica.safetensors")
                        .load(&group, &Device::Cpu)
                        .err()
                })
            })
            .collect();

        for handle in handles {
            let err = handle.join().unwrap().unwrap();
            assert!(matches!(err, Error::InvalidCheckpoint(_)));
            assert!(!err.is_retryable());
        }
    }
}
