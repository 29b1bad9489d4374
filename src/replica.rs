use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info};

use crate::backend::ReduceOp;
use crate::error::{Error, Result};
use crate::models::ReplicaModel;
use crate::process_group::{ProcessGroup, COORDINATOR};

pub struct BackwardResult {
    pub grads: GradStore,
    pub computation_time_ms: f64,
    pub communication_time_ms: f64,
    pub bytes_reduced: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub communication_time_ms: f64,
    pub bytes_reduced: usize,
}

/// Parameters whose gradients travel together in one all-reduce.
#[derive(Debug, Clone)]
struct Bucket {
    members: Vec<usize>,
    numel: usize,
}

struct Job {
    bucket: usize,
    data: Vec<f32>,
}

/// Dedicated thread that issues one `all_reduce(Sum)` per submitted bucket,
/// strictly in submission order.
struct ReductionWorker {
    jobs: Option<Sender<Job>>,
    results: Receiver<(usize, Result<Vec<f32>>)>,
    handle: Option<JoinHandle<()>>,
}

impl ReductionWorker {
    fn spawn(group: Arc<ProcessGroup>) -> Self {
        let (job_tx, job_rx) = unbounded::<Job>();
        let (result_tx, result_rx) = unbounded();

        let handle = thread::spawn(move || {
            let mut poisoned = false;
            for job in job_rx {
                // After a failure the peers' sequence is unknown; fail fast.
                let result = if poisoned {
                    Err(Error::Transport(format!(
                        "rank {}: bucket {} abandoned after an earlier reduction failed",
                        group.rank(),
                        job.bucket
                    )))
                } else {
                    group.all_reduce(&job.data, ReduceOp::Sum)
                };
                poisoned |= result.is_err();
                if result_tx.send((job.bucket, result)).is_err() {
                    return;
                }
            }
        });

        Self {
            jobs: Some(job_tx),
            results: result_rx,
            handle: Some(handle),
        }
    }

    fn submit(&self, bucket: usize, data: Vec<f32>) -> Result<()> {
        self.jobs
            .as_ref()
            .and_then(|tx| tx.send(Job { bucket, data }).ok())
            .ok_or_else(|| Error::Transport("gradient reduction worker has stopped".into()))
    }

    fn wait(&self) -> Result<(usize, Result<Vec<f32>>)> {
        self.results
            .recv()
            .map_err(|_| Error::Transport("gradient reduction worker has stopped".into()))
    }
}

impl Drop for ReductionWorker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Keeps one model replica per rank in lockstep by averaging gradients.
pub struct ReplicaSynchronizer {
    model: Box<dyn ReplicaModel>,
    group: Arc<ProcessGroup>,
    params: Vec<(String, Var)>,
    buckets: Vec<Bucket>,
    worker: ReductionWorker,
}

impl ReplicaSynchronizer {
    /// Wraps `model`, assigns gradient buckets, and checks that every rank
    /// built the same parameter layout.
    pub fn new(model: Box<dyn ReplicaModel>, group: Arc<ProcessGroup>, bucket_cap_bytes: usize) -> Result<Self> {
        let params = model.named_parameters()?;
        if params.is_empty() {
            return Err(Error::Config(format!("model {} has no parameters", model.name())));
        }

        verify_layout(&group, &params)?;
        let buckets = assign_buckets(&params, bucket_cap_bytes);
        info!(
            "🔄 Rank {}: {} parameters in {} gradient buckets (cap {} bytes)",
            group.rank(),
            params.len(),
            buckets.len(),
            bucket_cap_bytes
        );

        let worker = ReductionWorker::spawn(group.clone());
        Ok(Self {
            model,
            group,
            params,
            buckets,
            worker,
        })
    }

    pub fn model(&self) -> &dyn ReplicaModel {
        self.model.as_ref()
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn named_parameters(&self) -> &[(String, Var)] {
        &self.params
    }

    pub fn parameters(&self) -> Vec<Var> {
        self.params.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Local forward pass; no communication.
    pub fn forward(&self, input: &Tensor, dtype: DType) -> Result<Tensor> {
        self.model.forward(input, dtype)
    }

    /// Autodiff followed by gradient averaging across the group.
    pub fn backward(&self, loss: &Tensor) -> Result<BackwardResult> {
        let start = Instant::now();
        let mut grads = loss.backward()?;
        let computation_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        let stats = self.synchronize(&mut grads)?;
        Ok(BackwardResult {
            grads,
            computation_time_ms,
            communication_time_ms: stats.communication_time_ms,
            bytes_reduced: stats.bytes_reduced,
        })
    }

    /// Replaces every parameter's gradient with the group average.
    ///
    /// Buckets are flattened and handed to the reduction worker one by one,
    /// so later buckets are packed while earlier ones are on the wire. Returns
    /// only after every pending reduction has completed.
    pub fn synchronize(&self, grads: &mut GradStore) -> Result<SyncStats> {
        let start = Instant::now();
        let world = self.group.world_size() as f32;

        let mut bytes_reduced = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            let data = self.flatten(bucket, grads)?;
            bytes_reduced += data.len() * std::mem::size_of::<f32>();
            self.worker.submit(index, data)?;
        }

        // Every submitted bucket is drained, even after an error, so no
        // result is left queued for the next step.
        let mut first_error = None;
        for _ in 0..self.buckets.len() {
            let (index, result) = self.worker.wait()?;
            let written = match result {
                Ok(summed) if first_error.is_none() => self.scatter(&self.buckets[index], &summed, world, grads),
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let communication_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "rank {}: reduced {} bytes in {:.2} ms",
            self.group.rank(),
            bytes_reduced,
            communication_time_ms
        );
        Ok(SyncStats {
            communication_time_ms,
            bytes_reduced,
        })
    }

    fn flatten(&self, bucket: &Bucket, grads: &GradStore) -> Result<Vec<f32>> {
        let mut data = Vec::with_capacity(bucket.numel);
        for &i in &bucket.members {
            let param = self.params[i].1.as_tensor();
            match grads.get(param) {
                Some(grad) => data.extend(grad.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?),
                // Unused parameters still occupy their slot on every rank.
                None => data.resize(data.len() + param.elem_count(), 0.0),
            }
        }
        Ok(data)
    }

    fn scatter(&self, bucket: &Bucket, summed: &[f32], world: f32, grads: &mut GradStore) -> Result<()> {
        if summed.len() != bucket.numel {
            return Err(Error::Transport(format!(
                "reduced bucket has {} values, expected {}",
                summed.len(),
                bucket.numel
            )));
        }
        let mut offset = 0;
        for &i in &bucket.members {
            let param = self.params[i].1.as_tensor();
            let n = param.elem_count();
            let averaged: Vec<f32> = summed[offset..offset + n].iter().map(|v| v / world).collect();
            let grad = Tensor::from_vec(averaged, param.shape(), param.device())?.to_dtype(param.dtype())?;
            grads.insert(param, grad);
            offset += n;
        }
        Ok(())
    }
}

/// Buckets in reverse parameter order, each closed once it reaches the cap.
fn assign_buckets(params: &[(String, Var)], cap_bytes: usize) -> Vec<Bucket> {
    let mut buckets = Vec::new();
    let mut current = Bucket {
        members: Vec::new(),
        numel: 0,
    };

    for i in (0..params.len()).rev() {
        let numel = params[i].1.as_tensor().elem_count();
        let full = (current.numel + numel) * std::mem::size_of::<f32>() > cap_bytes;
        if full && !current.members.is_empty() {
            buckets.push(std::mem::replace(
                &mut current,
                Bucket {
                    members: Vec::new(),
                    numel: 0,
                },
            ));
        }
        current.members.push(i);
        current.numel += numel;
    }
    if !current.members.is_empty() {
        buckets.push(current);
    }
    buckets
}

fn layout_digest(params: &[(String, Var)]) -> String {
    let mut context = md5::Context::new();
    for (name, var) in params {
        context.consume(name.as_bytes());
        context.consume([0u8]);
        for dim in var.as_tensor().dims() {
            context.consume((*dim as u64).to_le_bytes());
        }
        context.consume(format!("{:?}", var.as_tensor().dtype()).as_bytes());
    }
    format!("{:x}", context.compute())
}

fn verify_layout(group: &ProcessGroup, params: &[(String, Var)]) -> Result<()> {
    let mine = layout_digest(params);
    let reference = group.broadcast_bytes(mine.clone().into_bytes(), COORDINATOR)?;
    let matches = reference == mine.as_bytes();

    // Agree on the verdict so no rank proceeds alone.
    let flag = if matches { 0.0 } else { 1.0 };
    let mismatched = group.all_reduce(&[flag], ReduceOp::Max)?;
    if mismatched[0] > 0.0 {
        let detail = if matches {
            "another rank built a different parameter layout".to_string()
        } else {
            format!(
                "layout digest {} differs from rank {}'s {}",
                mine,
                COORDINATOR,
                String::from_utf8_lossy(&reference)
            )
        };
        return Err(Error::ReplicaMismatch {
            rank: group.rank(),
            detail,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use crate::backend::CommunicationBackend;
    use crate::models::Mlp;
    use crate::seed::reinitialize_parameters;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Single-rank fabric whose first gradient reduction comes back one value short.
    struct ShortFirstReduction {
        reductions: AtomicUsize,
    }

    impl CommunicationBackend for ShortFirstReduction {
        fn name(&self) -> &str {
            "short-first"
        }

        fn rank(&self) -> usize {
            0
        }

        fn world_size(&self) -> usize {
            1
        }

        fn all_reduce(&self, data: &[f32], _op: ReduceOp) -> Result<Vec<f32>> {
            // The layout check reduces a single flag; leave it intact.
            if data.len() > 1 && self.reductions.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(data[1..].to_vec());
            }
            Ok(data.to_vec())
        }

        fn broadcast_bytes(&self, data: Vec<u8>, _src: usize) -> Result<Vec<u8>> {
            Ok(data)
        }
    }

    fn local_grads(sync: &ReplicaSynchronizer, grads: &GradStore) -> Vec<Vec<f32>> {
        sync.named_parameters()
            .iter()
            .map(|(_, v)| grads.get(v.as_tensor()).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    fn named(sizes: &[usize]) -> Vec<(String, Var)> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| (format!("p{}", i), Var::zeros(n, DType::F32, &Device::Cpu).unwrap()))
            .collect()
    }

    #[test]
    fn buckets_run_in_reverse_and_respect_the_cap() {
        let params = named(&[4, 4, 4, 10]);
        let buckets = assign_buckets(&params, 32);
        let members: Vec<Vec<usize>> = buckets.iter().map(|b| b.members.clone()).collect();
        // An oversized parameter gets a bucket of its own.
        assert_eq!(members, vec![vec![3], vec![2, 1], vec![0]]);
        assert_eq!(buckets.iter().map(|b| b.numel).sum::<usize>(), 22);
    }

    #[test]
    fn two_ranks_average_their_gradients() {
        let handles: Vec<_> = ProcessGroup::local(2, Duration::from_secs(10))
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let model = Mlp::new(4, &[3], 2, &Device::Cpu).unwrap();
                    reinitialize_parameters(model.varmap(), 11).unwrap();
                    let rank = group.rank();
                    let sync = ReplicaSynchronizer::new(Box::new(model), Arc::new(group), 64).unwrap();
                    assert!(sync.num_buckets() > 1);

                    let input = Tensor::new(&[[rank as f32 + 1.0, -1.0, 0.5, 2.0]], &Device::Cpu).unwrap();
                    let loss = sync.forward(&input, DType::F32).unwrap().sqr().unwrap().sum_all().unwrap();

                    let local = loss.backward().unwrap();
                    let local: Vec<Vec<f32>> = sync
                        .named_parameters()
                        .iter()
                        .map(|(_, v)| local.get(v.as_tensor()).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap())
                        .collect();

                    let result = sync.backward(&loss).unwrap();
                    let synced: Vec<Vec<f32>> = sync
                        .named_parameters()
                        .iter()
                        .map(|(_, v)| result.grads.get(v.as_tensor()).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap())
                        .collect();
                    (local, synced)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let (g0, synced0) = &results[0];
        let (g1, synced1) = &results[1];
        assert_eq!(synced0, synced1);
        for (p, synced) in synced0.iter().enumerate() {
            for (j, value) in synced.iter().enumerate() {
                let expected = (g0[p][j] + g1[p][j]) / 2.0;
                assert!((value - expected).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn failed_bucket_leaves_nothing_queued_for_the_next_step() {
        let model = Mlp::new(4, &[3], 2, &Device::Cpu).unwrap();
        reinitialize_parameters(model.varmap(), 5).unwrap();
        let group = ProcessGroup::from_backend(ShortFirstReduction {
            reductions: AtomicUsize::new(0),
        });
        let sync = ReplicaSynchronizer::new(Box::new(model), Arc::new(group), 16).unwrap();
        assert!(sync.num_buckets() > 2);

        let first = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &Device::Cpu).unwrap();
        let loss = sync.forward(&first, DType::F32).unwrap().sqr().unwrap().sum_all().unwrap();
        let err = sync.backward(&loss).err().unwrap();
        assert!(matches!(err, Error::Transport(_)));

        let second = Tensor::new(&[[-2.0f32, 0.5, 1.0, -1.0]], &Device::Cpu).unwrap();
        let loss = sync.forward(&second, DType::F32).unwrap().sqr().unwrap().sum_all().unwrap();
        let expected = local_grads(&sync, &loss.backward().unwrap());
        let result = sync.backward(&loss).unwrap();
        assert_eq!(local_grads(&sync, &result.grads), expected);
    }

    #[test]
    fn mismatched_layouts_fail_on_every_rank() {
        let handles: Vec<_> = ProcessGroup::local(2, Duration::from_secs(10))
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let hidden = if group.rank() == 0 { 3 } else { 5 };
                    let model = Mlp::new(4, &[hidden], 2, &Device::Cpu).unwrap();
                    ReplicaSynchronizer::new(Box::new(model), Arc::new(group), 1 << 20).err()
                })
            })
            .collect();

        for handle in handles {
            let err = handle.join().unwrap().unwrap();
            assert!(matches!(err, Error::ReplicaMismatch { .. }));
            assert!(!err.is_retryable());
        }
    }
}
