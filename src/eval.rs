use candle_core::DType;
use tracing::info;

use crate::data::DataLoader;
use crate::error::Result;
use crate::models::ReplicaModel;
use crate::process_group::COORDINATOR;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub correct: usize,
    pub total: usize,
    pub accuracy: f64,
}

/// Decides when the held-out set is scored, and by whom.
///
/// Evaluation issues no collectives, so non-coordinating ranks simply move on.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationGate {
    every: usize,
    coordinator: usize,
}

impl EvaluationGate {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            coordinator: COORDINATOR,
        }
    }

    pub fn should_run(&self, epoch: usize, rank: usize) -> bool {
        rank == self.coordinator && epoch % self.every == 0
    }

    pub fn evaluate(&self, model: &dyn ReplicaModel, loader: DataLoader, dtype: DType) -> Result<EvalReport> {
        let mut correct = 0;
        let mut total = 0;

        for batch in loader {
            let batch = batch?;
            let logits = model.forward(&batch.inputs, dtype)?;
            let predicted = logits.argmax(1)?.to_dtype(DType::U32)?;
            let hits = predicted
                .eq(&batch.labels)?
                .to_dtype(DType::U32)?
                .sum_all()?
                .to_scalar::<u32>()?;
            correct += hits as usize;
            total += batch.len();
        }

        let accuracy = if total == 0 { 0.0 } else { correct as f64 / total as f64 };
        info!("🎯 Accuracy: {}/{} ({:.2}%)", correct, total, accuracy * 100.0);
        Ok(EvalReport {
            correct,
            total,
            accuracy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{synthetic_split, Dataset};
    use crate::models::{InputSpec, Mlp};
    use candle_core::Device;
    use std::sync::Arc;

    #[test]
    fn cadence_of_ten_over_twenty_five_epochs() {
        let gate = EvaluationGate::new(10);
        for rank in 0..4 {
            let epochs: Vec<usize> = (0..25).filter(|&e| gate.should_run(e, rank)).collect();
            if rank == 0 {
                assert_eq!(epochs, vec![0, 10, 20]);
            } else {
                assert!(epochs.is_empty());
            }
        }
    }

    #[test]
    fn accuracy_counts_every_sample_once() {
        let spec = InputSpec {
            channels: 1,
            height: 2,
            width: 2,
            num_classes: 3,
        };
        let (_, test) = synthetic_split(3, 10, spec, 0).unwrap();
        let dataset: Arc<dyn Dataset> = Arc::new(test);
        let model = Mlp::new(spec.features(), &[5], spec.num_classes, &Device::Cpu).unwrap();

        let loader = DataLoader::sequential(dataset.clone(), 4, 1, Device::Cpu);
        let report = EvaluationGate::new(1).evaluate(&model, loader, DType::F32).unwrap();
        assert_eq!(report.total, 10);
        assert!(report.correct <= 10);
        assert!((report.accuracy - report.correct as f64 / 10.0).abs() < 1e-12);

        // Deterministic: a second pass scores the same.
        let loader = DataLoader::sequential(dataset, 4, 2, Device::Cpu);
        let again = EvaluationGate::new(1).evaluate(&model, loader, DType::F32).unwrap();
        assert_eq!(again, report);
    }
}
