use candle_core::{DType, Var};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::backend::DeviceManager;
use crate::checkpoint::{CheckpointManager, Progress, Snapshot};
use crate::config::TrainConfig;
use crate::data::{load_datasets, Augmentation, DataLoader, Dataset};
use crate::error::Result;
use crate::eval::EvaluationGate;
use crate::metrics::{EpochMetrics, EpochRecorder, RunSummary};
use crate::models::create_model;
use crate::optim::{MomentumSgd, SgdConfig};
use crate::partition::DistributedSampler;
use crate::process_group::{ProcessGroup, ProcessGroupConfig};
use crate::replica::ReplicaSynchronizer;
use crate::scaler::{GradScaler, StepOutcome};
use crate::seed::{parameter_fingerprint, reinitialize_parameters, seed_everything};

/// Full training entrypoint: rendezvous, replica setup, optional resume,
/// then every epoch through to the final checkpoint.
pub fn run_training(config: &TrainConfig) -> Result<RunSummary> {
    Trainer::new(config.clone())?.run()
}

/// One rank's share of a data-parallel run.
pub struct Trainer {
    config: TrainConfig,
    device_manager: DeviceManager,
    group: Arc<ProcessGroup>,
    replica: ReplicaSynchronizer,
    params: Vec<Var>,
    optimizer: MomentumSgd,
    scaler: GradScaler,
    checkpoints: CheckpointManager,
    gate: EvaluationGate,
    train_set: Arc<dyn Dataset>,
    test_set: Arc<dyn Dataset>,
    sampler: DistributedSampler,
    dtype: DType,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let group = ProcessGroup::init(&ProcessGroupConfig::from_train_config(&config))?;
        Self::with_group(config, group)
    }

    /// Builds the trainer on an already-joined group. The group's rank and
    /// size take precedence over the configuration.
    pub fn with_group(mut config: TrainConfig, group: ProcessGroup) -> Result<Self> {
        config.distributed.local_rank = group.rank();
        config.distributed.world_size = group.world_size();
        config.validate()?;

        let rank = group.rank();
        let seed = config.training.random_seed;
        info!(
            "🔧 Rank {}/{}: initializing trainer over {}",
            rank,
            group.world_size(),
            group.backend_name()
        );

        let device_manager = DeviceManager::for_rank(&config.distributed.device_type, rank)?;
        seed_everything(seed, device_manager.device())?;
        let dtype = config.compute_dtype()?;

        let (train_set, test_set) = load_datasets(&config.data, seed)?;
        let model = create_model(&config.training.model_type, train_set.spec(), device_manager.device())?;
        reinitialize_parameters(model.varmap(), seed)?;
        info!(
            "🧠 Rank {}: {} with {} parameters on {} ({:?})",
            rank,
            model.name(),
            model.parameter_count()?,
            device_manager.label(),
            dtype
        );

        let group = Arc::new(group);
        let replica = ReplicaSynchronizer::new(model, group.clone(), config.bucket_cap_bytes())?;
        let params = replica.parameters();

        let optimizer = MomentumSgd::with_names(
            replica.named_parameters().to_vec(),
            SgdConfig {
                learning_rate: config.training.learning_rate,
                momentum: config.training.momentum,
                weight_decay: config.training.weight_decay,
            },
        )?;
        let scaler = GradScaler::from_config(&config.precision, config.loss_scaling_enabled());
        let checkpoints = CheckpointManager::new(&config.checkpoint.model_dir, &config.checkpoint.model_filename);
        let gate = EvaluationGate::new(config.checkpoint.eval_every);
        let sampler = DistributedSampler::new(train_set.len(), rank, group.world_size(), seed, true)?;

        Ok(Self {
            config,
            device_manager,
            group,
            replica,
            params,
            optimizer,
            scaler,
            checkpoints,
            gate,
            train_set,
            test_set,
            sampler,
            dtype,
        })
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn replica(&self) -> &ReplicaSynchronizer {
        &self.replica
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let rank = self.group.rank();

        let mut progress = Progress {
            next_epoch: 0,
            global_step: 0,
        };
        if self.config.checkpoint.resume {
            if let Some(snapshot) = self.checkpoints.load(&self.group, self.device_manager.device())? {
                snapshot.apply(self.replica.named_parameters(), &mut self.optimizer, &mut self.scaler)?;
                progress = snapshot.progress();
                info!(
                    "⏩ Rank {}: resuming at epoch {} (step {})",
                    rank, progress.next_epoch, progress.global_step
                );
            }
        }

        let first_epoch = progress.next_epoch;
        let mut epochs = Vec::new();
        let mut final_accuracy = None;

        for epoch in first_epoch..self.config.training.num_epochs {
            info!("🏋️ Rank {}, epoch {}: training", rank, epoch);

            let mut accuracy = None;
            if self.gate.should_run(epoch, rank) {
                accuracy = Some(self.evaluate()?);
                final_accuracy = accuracy;
                self.save(Progress {
                    next_epoch: epoch,
                    global_step: progress.global_step,
                })?;
                info!("{}", "-".repeat(75));
                info!("📊 Epoch: {}, Accuracy: {:.4}", epoch, accuracy.unwrap_or_default());
                info!("{}", "-".repeat(75));
            }

            let metrics = self.train_epoch(epoch, &mut progress.global_step, accuracy)?;
            info!(
                "✅ Rank {}, epoch {}: loss {:.4}, {} steps ({} skipped), {:.1} samples/s",
                rank,
                epoch,
                metrics.mean_loss,
                metrics.steps,
                metrics.skipped_steps,
                metrics.throughput_samples_per_second
            );
            epochs.push(metrics);
            progress.next_epoch = epoch + 1;
        }

        self.save(progress)?;

        Ok(RunSummary {
            rank,
            world_size: self.group.world_size(),
            model: self.replica.model().name().to_string(),
            device: self.device_manager.label(),
            started_at,
            finished_at: Utc::now(),
            first_epoch,
            global_step: progress.global_step,
            final_loss_scale: self.scaler.scale(),
            final_accuracy,
            parameter_fingerprint: parameter_fingerprint(self.replica.model().varmap())?,
            epochs,
        })
    }

    fn train_epoch(&mut self, epoch: usize, global_step: &mut u64, accuracy: Option<f64>) -> Result<EpochMetrics> {
        let rank = self.group.rank();
        let batch_size = self.config.training.batch_size;
        let batches = self.sampler.batches(epoch, batch_size);
        let device = self.device_manager.device().clone();
        let prefetch = self.config.data.prefetch;

        let loader = if self.config.data.augment {
            let augmentation = Augmentation {
                padding: 4,
                seed: self
                    .config
                    .training
                    .random_seed
                    .wrapping_add(((epoch * self.group.world_size() + rank) as u64).wrapping_mul(1_000_003)),
            };
            DataLoader::spawn_augmented(self.train_set.clone(), batches, prefetch, device, augmentation)
        } else {
            DataLoader::spawn(self.train_set.clone(), batches, prefetch, device)
        };

        let bar = if self.group.is_coordinator() {
            let bar = ProgressBar::new(self.sampler.num_batches(batch_size) as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            bar
        } else {
            ProgressBar::hidden()
        };
        bar.set_message(format!("epoch {}", epoch));

        let start = Instant::now();
        let mut recorder = EpochRecorder::default();
        let check_every = self.config.precision.scale_check_interval;

        for batch in loader {
            let batch = batch?;

            let forward_start = Instant::now();
            let logits = self.replica.forward(&batch.inputs, self.dtype)?;
            let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
            let forward_ms = forward_start.elapsed().as_secs_f64() * 1000.0;

            let scaled = self.scaler.scale_loss(&loss)?;
            let mut backward = self.replica.backward(&scaled)?;
            let outcome = self.scaler.step(&mut self.optimizer, &mut backward.grads, &self.params)?;

            let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
            recorder.record_step(
                loss_value,
                batch.len(),
                forward_ms,
                backward.computation_time_ms,
                backward.communication_time_ms,
            );
            if outcome == StepOutcome::Skipped {
                recorder.record_skip();
            }

            *global_step += 1;
            if check_every > 0 && *global_step % check_every == 0 {
                self.scaler.verify_agreement(&self.group)?;
                debug!("rank {}: loss scale agreed at step {}", rank, global_step);
            }

            bar.set_message(format!("epoch {} loss {:.4}", epoch, loss_value));
            bar.inc(1);
        }
        bar.finish_and_clear();

        Ok(recorder.finish(
            epoch,
            start.elapsed().as_secs_f64(),
            self.scaler.scale(),
            accuracy,
        ))
    }

    fn evaluate(&self) -> Result<f64> {
        let loader = DataLoader::sequential(
            self.test_set.clone(),
            self.config.data.eval_batch_size,
            self.config.data.prefetch,
            self.device_manager.device().clone(),
        );
        let report = self.gate.evaluate(self.replica.model(), loader, self.dtype)?;
        Ok(report.accuracy)
    }

    fn save(&self, progress: Progress) -> Result<()> {
        if !self.group.is_coordinator() {
            return Ok(());
        }
        let snapshot = Snapshot::capture(
            self.replica.model().name(),
            self.replica.named_parameters(),
            &self.optimizer,
            &self.scaler,
            progress,
            self.group.world_size(),
        )?;
        self.checkpoints.save(&self.group, &snapshot)?;
        Ok(())
    }
}
