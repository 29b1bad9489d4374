use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Statistics {
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl Statistics {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }

        let sum: f64 = values.iter().sum();
        let mean = sum / values.len() as f64;

        let variance: f64 = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let std_dev = variance.sqrt();

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let median = if sorted.len() % 2 == 0 {
            (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
        } else {
            sorted[sorted.len() / 2]
        };

        Self {
            mean,
            std_dev,
            median,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub steps: usize,
    pub skipped_steps: usize,
    pub samples: usize,
    pub mean_loss: f64,
    pub duration_secs: f64,
    pub throughput_samples_per_second: f64,
    pub forward_time_ms: Statistics,
    pub backward_time_ms: Statistics,
    pub communication_time_ms: Statistics,
    pub loss_scale: f64,
    /// Held-out accuracy measured at the start of the epoch, when gated in.
    pub accuracy: Option<f64>,
}

/// Per-step samples folded into [`EpochMetrics`] at the end of an epoch.
#[derive(Debug, Default)]
pub struct EpochRecorder {
    losses: Vec<f64>,
    forward_ms: Vec<f64>,
    backward_ms: Vec<f64>,
    communication_ms: Vec<f64>,
    skipped: usize,
    samples: usize,
}

impl EpochRecorder {
    pub fn record_step(&mut self, loss: f64, samples: usize, forward_ms: f64, backward_ms: f64, communication_ms: f64) {
        self.losses.push(loss);
        self.samples += samples;
        self.forward_ms.push(forward_ms);
        self.backward_ms.push(backward_ms);
        self.communication_ms.push(communication_ms);
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn finish(self, epoch: usize, duration_secs: f64, loss_scale: f64, accuracy: Option<f64>) -> EpochMetrics {
        // Skipped steps contribute a non-finite loss; keep them out of the mean.
        let finite: Vec<f64> = self.losses.iter().copied().filter(|l| l.is_finite()).collect();
        let mean_loss = if finite.is_empty() {
            f64::NAN
        } else {
            finite.iter().sum::<f64>() / finite.len() as f64
        };

        EpochMetrics {
            epoch,
            steps: self.losses.len(),
            skipped_steps: self.skipped,
            samples: self.samples,
            mean_loss,
            duration_secs,
            throughput_samples_per_second: if duration_secs > 0.0 {
                self.samples as f64 / duration_secs
            } else {
                0.0
            },
            forward_time_ms: Statistics::from_values(&self.forward_ms),
            backward_time_ms: Statistics::from_values(&self.backward_ms),
            communication_time_ms: Statistics::from_values(&self.communication_ms),
            loss_scale,
            accuracy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub rank: usize,
    pub world_size: usize,
    pub model: String,
    pub device: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub first_epoch: usize,
    pub global_step: u64,
    pub final_loss_scale: f64,
    pub final_accuracy: Option<f64>,
    pub parameter_fingerprint: String,
    pub epochs: Vec<EpochMetrics>,
}

impl RunSummary {
    pub fn total_skipped(&self) -> usize {
        self.epochs.iter().map(|e| e.skipped_steps).sum()
    }

    pub fn display_table(&self) -> String {
        use tabled::{Table, Tabled};

        #[derive(Tabled)]
        struct EpochRow {
            epoch: usize,
            steps: usize,
            skipped: usize,
            mean_loss: String,
            samples_s: String,
            comm_ms: String,
            scale: String,
            accuracy: String,
        }

        let rows: Vec<EpochRow> = self
            .epochs
            .iter()
            .map(|e| EpochRow {
                epoch: e.epoch,
                steps: e.steps,
                skipped: e.skipped_steps,
                mean_loss: format!("{:.4}", e.mean_loss),
                samples_s: format!("{:.1}", e.throughput_samples_per_second),
                comm_ms: format!("{:.2}", e.communication_time_ms.mean),
                scale: format!("{}", e.loss_scale),
                accuracy: e
                    .accuracy
                    .map(|a| format!("{:.2}%", a * 100.0))
                    .unwrap_or_else(|| "-".to_string()),
            })
            .collect();

        Table::new(rows).to_string()
    }

    pub fn display_summary(&self) -> String {
        use tabled::{Table, Tabled};

        #[derive(Tabled)]
        struct ResultRow {
            metric: String,
            value: String,
        }

        let rows = vec![
            ResultRow { metric: "Rank".to_string(), value: format!("{}/{}", self.rank, self.world_size) },
            ResultRow { metric: "Model".to_string(), value: self.model.clone() },
            ResultRow { metric: "Device".to_string(), value: self.device.clone() },
            ResultRow {
                metric: "Epochs".to_string(),
                value: format!("{} (from {})", self.epochs.len(), self.first_epoch),
            },
            ResultRow { metric: "Global step".to_string(), value: format_number(self.global_step as usize) },
            ResultRow { metric: "Skipped steps".to_string(), value: self.total_skipped().to_string() },
            ResultRow { metric: "Final loss scale".to_string(), value: format!("{}", self.final_loss_scale) },
            ResultRow {
                metric: "Final accuracy".to_string(),
                value: self
                    .final_accuracy
                    .map(|a| format!("{:.2}%", a * 100.0))
                    .unwrap_or_else(|| "-".to_string()),
            },
            ResultRow {
                metric: "Wall time (s)".to_string(),
                value: format!("{:.1}", (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0),
            },
            ResultRow { metric: "Parameters (md5)".to_string(), value: self.parameter_fingerprint.clone() },
        ];

        Table::new(rows).to_string()
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

// Utility functions
pub fn format_number(n: usize) -> String {
    if n >= 1_000_000_000 {
        format!("{:.1}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
