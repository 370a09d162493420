//! The epoch loop: pulls batches from the stream, runs one trainer step per
//! batch, and records per-step scalars.

use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Instant;

use crate::config::TrainingConfig;
use crate::data::{BatchStream, Sample, StreamOptions};
use crate::distributed::Trainer;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub epoch: usize,
    pub step_in_epoch: usize,
    /// Global step, 1-based.
    pub step: u64,
    pub loss: f32,
    pub vision_loss: f32,
    pub location_loss: f32,
    pub accuracy: f32,
    pub latency_ms: f64,
    pub finite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub steps: usize,
    pub mean_loss: f32,
    pub mean_accuracy: f32,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub records: Vec<StepRecord>,
    pub epochs: Vec<EpochSummary>,
}

impl TrainingReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.records.last().map(|r| r.loss)
    }

    pub fn non_finite_steps(&self) -> usize {
        self.records.iter().filter(|r| !r.finite).count()
    }

    fn summarize(&mut self, epoch: usize) {
        let records: Vec<&StepRecord> = self.records.iter().filter(|r| r.epoch == epoch).collect();
        if records.is_empty() {
            return;
        }
        let steps = records.len();
        let mean_loss = records.iter().map(|r| r.loss).sum::<f32>() / steps as f32;
        let mean_accuracy = records.iter().map(|r| r.accuracy).sum::<f32>() / steps as f32;

        tracing::info!(
            epoch,
            steps,
            mean_loss,
            mean_accuracy,
            "Epoch {} complete",
            epoch + 1
        );
        self.epochs.push(EpochSummary {
            epoch,
            steps,
            mean_loss,
            mean_accuracy,
        });
    }
}

pub struct TrainingDriver {
    epochs: usize,
    shuffle: bool,
    seed: u64,
    prefetch: usize,
    metrics: Option<Box<dyn Write + Send>>,
}

impl TrainingDriver {
    /// Driver for `config`, opening its JSON-lines metrics file if one is set.
    pub fn new(config: &TrainingConfig) -> Result<Self> {
        let mut driver = Self {
            epochs: config.epochs,
            shuffle: config.shuffle,
            seed: config.seed,
            prefetch: config.prefetch,
            metrics: None,
        };

        if let Some(path) = &config.metrics_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(path)?;
            tracing::info!(path = %path.display(), "Writing step metrics");
            driver = driver.with_metrics_writer(BufWriter::new(file));
        }

        Ok(driver)
    }

    /// Emit one JSON object per step to `writer`.
    pub fn with_metrics_writer<W: Write + Send + 'static>(mut self, writer: W) -> Self {
        self.metrics = Some(Box::new(writer));
        self
    }

    /// Train for the configured number of epochs. Each epoch visits every
    /// sample once in global-batch-sized steps; the remainder is dropped.
    pub fn run(&mut self, trainer: &mut Trainer, samples: Arc<[Sample]>) -> Result<TrainingReport> {
        let stream = BatchStream::spawn(
            samples,
            StreamOptions {
                epochs: self.epochs,
                batch_size: trainer.plan().global_batch_size(),
                shuffle: self.shuffle,
                seed: self.seed,
                prefetch: self.prefetch,
            },
        )?;

        tracing::info!(
            epochs = self.epochs,
            steps_per_epoch = stream.steps_per_epoch(),
            global_batch = trainer.plan().global_batch_size(),
            "Training started"
        );

        let mut report = TrainingReport::default();
        let mut current_epoch = None;

        for item in stream {
            let item = item?;
            if let Some(previous) = current_epoch {
                if previous != item.epoch {
                    report.summarize(previous);
                }
            }
            current_epoch = Some(item.epoch);

            let started = Instant::now();
            let metrics = trainer.step(&item.batch)?;
            let elapsed = started.elapsed();

            let record = StepRecord {
                epoch: item.epoch,
                step_in_epoch: item.step_in_epoch,
                step: metrics.step,
                loss: metrics.loss,
                vision_loss: metrics.vision_loss,
                location_loss: metrics.location_loss,
                accuracy: metrics.accuracy,
                latency_ms: elapsed.as_secs_f64() * 1000.0,
                finite: metrics.finite,
            };

            tracing::info!(
                "Step {}: loss={:.4}, acc={:.4}, time={:.2}s",
                record.step,
                record.loss,
                record.accuracy,
                elapsed.as_secs_f64()
            );
            self.write_metrics(&record)?;
            report.records.push(record);
        }

        if let Some(last) = current_epoch {
            report.summarize(last);
        }
        if let Some(writer) = self.metrics.as_mut() {
            writer.flush()?;
        }

        tracing::info!(
            steps = report.records.len(),
            non_finite = report.non_finite_steps(),
            "Training finished"
        );
        Ok(report)
    }

    fn write_metrics(&mut self, record: &StepRecord) -> Result<()> {
        if let Some(writer) = self.metrics.as_mut() {
            serde_json::to_writer(&mut *writer, record).map_err(|e| Error::Io(e.into()))?;
            writeln!(writer)?;
        }
        Ok(())
    }
}
