use candle_core::{DType, Device, Tensor};
use crossbeam::channel::{bounded, Receiver};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::DataConfig;
use crate::error::{Error, Result};
use crate::models::InputSpec;

const CIFAR_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
const CIFAR_STD: [f32; 3] = [0.2023, 0.1994, 0.2010];

/// One collated minibatch: `inputs` is `(B, C, H, W)` f32, `labels` is `(B,)` u32.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An indexable, sized collection of labelled samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;
    fn spec(&self) -> InputSpec;

    /// Gathers `indices` into one host-side batch.
    fn get_batch(&self, indices: &[usize]) -> Result<Batch>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Samples held as two host tensors.
pub struct TensorDataset {
    images: Tensor,
    labels: Tensor,
    spec: InputSpec,
}

impl TensorDataset {
    pub fn new(images: Tensor, labels: Tensor, spec: InputSpec) -> Result<Self> {
        let n = images.dims().first().copied().unwrap_or(0);
        if labels.dims() != [n] {
            return Err(Error::Config(format!(
                "{} images but labels of shape {:?}",
                n,
                labels.dims()
            )));
        }
        Ok(Self {
            images: images.to_dtype(DType::F32)?,
            labels: labels.to_dtype(DType::U32)?,
            spec,
        })
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    fn spec(&self) -> InputSpec {
        self.spec
    }

    fn get_batch(&self, indices: &[usize]) -> Result<Batch> {
        if let Some(bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(Error::Config(format!(
                "sample index {} out of range for {} samples",
                bad,
                self.len()
            )));
        }
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, indices.len(), self.images.device())?;
        Ok(Batch {
            inputs: self.images.index_select(&idx, 0)?,
            labels: self.labels.index_select(&idx, 0)?,
        })
    }
}

/// Noisy copies of one fixed pattern per class; learnable in a few epochs.
pub fn synthetic_split(
    train_size: usize,
    test_size: usize,
    spec: InputSpec,
    seed: u64,
) -> Result<(TensorDataset, TensorDataset)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let features = spec.features();
    let prototypes: Vec<Vec<f32>> = (0..spec.num_classes)
        .map(|_| (0..features).map(|_| rng.random_range(-1.0f32..1.0)).collect())
        .collect();

    let mut make = |n: usize| -> Result<TensorDataset> {
        let mut images = Vec::with_capacity(n * features);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let class = i % spec.num_classes;
            images.extend(prototypes[class].iter().map(|p| p + rng.random_range(-0.5f32..0.5)));
            labels.push(class as u32);
        }
        let images = Tensor::from_vec(images, (n, spec.channels, spec.height, spec.width), &Device::Cpu)?;
        let labels = Tensor::from_vec(labels, n, &Device::Cpu)?;
        TensorDataset::new(images, labels, spec)
    };

    let train = make(train_size)?;
    let test = make(test_size)?;
    Ok((train, test))
}

/// CIFAR-10 binary batches, normalized per channel.
pub fn cifar10_split(data_dir: &std::path::Path) -> Result<(TensorDataset, TensorDataset)> {
    if !data_dir.is_dir() {
        return Err(Error::Config(format!(
            "CIFAR-10 directory {} does not exist",
            data_dir.display()
        )));
    }
    let raw = candle_datasets::vision::cifar::load_dir(data_dir)?;
    info!(
        "📦 Loaded CIFAR-10: {} train / {} test images",
        raw.train_images.dims()[0],
        raw.test_images.dims()[0]
    );

    let mean = Tensor::from_slice(&CIFAR_MEAN, (1, 3, 1, 1), &Device::Cpu)?;
    let std = Tensor::from_slice(&CIFAR_STD, (1, 3, 1, 1), &Device::Cpu)?;
    let normalize = |images: &Tensor| -> Result<Tensor> {
        Ok(images
            .to_dtype(DType::F32)?
            .broadcast_sub(&mean)?
            .broadcast_div(&std)?)
    };

    let spec = InputSpec::cifar10();
    let train = TensorDataset::new(normalize(&raw.train_images)?, raw.train_labels, spec)?;
    let test = TensorDataset::new(normalize(&raw.test_images)?, raw.test_labels, spec)?;
    Ok((train, test))
}

/// Builds the train and held-out sets named by the configuration.
pub fn load_datasets(config: &DataConfig, seed: u64) -> Result<(Arc<dyn Dataset>, Arc<dyn Dataset>)> {
    let (train, test) = match config.dataset.as_str() {
        "synthetic" => synthetic_split(
            config.synthetic_train_size,
            config.synthetic_test_size,
            InputSpec::cifar10(),
            seed,
        )?,
        "cifar10" => cifar10_split(&config.data_dir)?,
        other => return Err(Error::Config(format!("unknown dataset: {}", other))),
    };
    Ok((Arc::new(train), Arc::new(test)))
}

/// Random crop after zero padding plus random horizontal flip, drawn per
/// sample from an RNG keyed by `seed` and the batch position.
#[derive(Debug, Clone, Copy)]
pub struct Augmentation {
    pub padding: usize,
    pub seed: u64,
}

impl Augmentation {
    pub fn apply(&self, images: &Tensor, batch_index: usize) -> Result<Tensor> {
        let (n, _, h, w) = images.dims4()?;
        let p = self.padding;
        let mut rng = StdRng::seed_from_u64(
            self.seed ^ (batch_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
        let padded = images.pad_with_zeros(2, p, p)?.pad_with_zeros(3, p, p)?;
        let reversed: Vec<u32> = (0..w as u32).rev().collect();
        let reversed = Tensor::from_vec(reversed, w, images.device())?;

        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let dy = rng.random_range(0..=2 * p);
            let dx = rng.random_range(0..=2 * p);
            let mut img = padded.get(i)?.narrow(1, dy, h)?.narrow(2, dx, w)?;
            if rng.random_bool(0.5) {
                img = img.index_select(&reversed, 2)?;
            }
            out.push(img);
        }
        Ok(Tensor::stack(&out, 0)?)
    }
}

/// Iterator over batches collated by a background worker.
///
/// The worker runs at most `prefetch` batches ahead of the consumer, so
/// gathering and host-to-device copies overlap with compute.
pub struct DataLoader {
    rx: Receiver<Result<Batch>>,
    worker: Option<JoinHandle<()>>,
    remaining: usize,
}

impl DataLoader {
    pub fn spawn(dataset: Arc<dyn Dataset>, batches: Vec<Vec<usize>>, prefetch: usize, device: Device) -> Self {
        Self::start(dataset, batches, prefetch, device, None)
    }

    pub fn spawn_augmented(
        dataset: Arc<dyn Dataset>,
        batches: Vec<Vec<usize>>,
        prefetch: usize,
        device: Device,
        augmentation: Augmentation,
    ) -> Self {
        Self::start(dataset, batches, prefetch, device, Some(augmentation))
    }

    fn start(
        dataset: Arc<dyn Dataset>,
        batches: Vec<Vec<usize>>,
        prefetch: usize,
        device: Device,
        augmentation: Option<Augmentation>,
    ) -> Self {
        let remaining = batches.len();
        let (tx, rx) = bounded(prefetch.max(1));

        let worker = thread::spawn(move || {
            for (index, indices) in batches.into_iter().enumerate() {
                let batch = dataset.get_batch(&indices).and_then(|b| {
                    let inputs = match &augmentation {
                        Some(aug) => aug.apply(&b.inputs, index)?,
                        None => b.inputs,
                    };
                    Ok(Batch {
                        inputs: inputs.to_device(&device)?,
                        labels: b.labels.to_device(&device)?,
                    })
                });
                let failed = batch.is_err();
                if tx.send(batch).is_err() {
                    debug!("data loader consumer went away");
                    return;
                }
                if failed {
                    return;
                }
            }
        });

        Self {
            rx,
            worker: Some(worker),
            remaining,
        }
    }

    /// Unsharded, unshuffled pass over the whole dataset.
    pub fn sequential(dataset: Arc<dyn Dataset>, batch_size: usize, prefetch: usize, device: Device) -> Self {
        let indices: Vec<usize> = (0..dataset.len()).collect();
        let batches = indices.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect();
        Self::spawn(dataset, batches, prefetch, device)
    }
}

impl Iterator for DataLoader {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.rx.recv() {
            Ok(batch) => {
                self.remaining -= 1;
                if batch.is_err() {
                    self.remaining = 0;
                }
                Some(batch)
            }
            Err(_) => {
                warn!("data loader worker exited early");
                self.remaining = 0;
                Some(Err(Error::Io(std::io::Error::other("data loader worker exited early"))))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl Drop for DataLoader {
    fn drop(&mut self) {
        // Disconnect first so a worker blocked on a full channel can exit.
        let (_, dead) = bounded(0);
        drop(std::mem::replace(&mut self.rx, dead));
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
