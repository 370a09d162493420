use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::{Sample, SampleBatch};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub epochs: usize,
    /// Samples per batch; the shard plan's global batch size.
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    /// Batches assembled ahead of the consumer.
    pub prefetch: usize,
}

#[derive(Debug)]
pub struct StreamItem {
    pub epoch: usize,
    pub step_in_epoch: usize,
    pub batch: SampleBatch,
}

/// Batches over in-memory samples for a fixed number of epochs.
///
/// Each epoch visits the samples once (optionally in a seeded shuffled order)
/// and drops the trailing partial batch. Batches are stacked on a producer
/// thread and handed over through a bounded channel.
pub struct BatchStream {
    rx: Receiver<Result<StreamItem>>,
    producer: Option<JoinHandle<()>>,
    steps_per_epoch: usize,
}

impl BatchStream {
    pub fn spawn(samples: Arc<[Sample]>, options: StreamOptions) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }

        let steps_per_epoch = samples.len() / options.batch_size;
        if steps_per_epoch == 0 {
            return Err(Error::ShapeMismatch {
                a: "samples",
                b: "global batch size",
                expected: options.batch_size,
                got: samples.len(),
            });
        }

        let (tx, rx) = mpsc::sync_channel(options.prefetch);
        let producer = thread::Builder::new()
            .name("batch-producer".to_string())
            .spawn(move || produce(&samples, &options, &tx))?;

        Ok(Self {
            rx,
            producer: Some(producer),
            steps_per_epoch,
        })
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }
}

fn produce(samples: &[Sample], options: &StreamOptions, tx: &SyncSender<Result<StreamItem>>) {
    let mut order: Vec<usize> = (0..samples.len()).collect();

    for epoch in 0..options.epochs {
        if options.shuffle {
            let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        for (step_in_epoch, chunk) in order.chunks_exact(options.batch_size).enumerate() {
            let refs: Vec<&Sample> = chunk.iter().map(|&i| &samples[i]).collect();
            let item = SampleBatch::from_samples(&refs).map(|batch| StreamItem {
                epoch,
                step_in_epoch,
                batch,
            });

            // The consumer hung up; nothing left to do.
            if tx.send(item).is_err() {
                return;
            }
        }
    }
}

impl Iterator for BatchStream {
    type Item = Result<StreamItem>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.rx.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                let producer = self.producer.take()?;
                match producer.join() {
                    Ok(()) => None,
                    Err(_) => Some(Err(Error::DataFormat(
                        "batch producer thread panicked".to_string(),
                    ))),
                }
            }
        }
    }
}
