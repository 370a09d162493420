//! Turns training CSV rows into paired [`Sample`]s.
//!
//! Each row names an image and either carries its embedding inline or is joined
//! to an [`EmbeddingTable`] by key. Rows are independent, so they are mapped
//! through an [`ExecutionStrategy`]; output order always follows input order.

mod image;
mod strategy;

pub use self::image::{load_image, preprocess_image};
pub use strategy::ExecutionStrategy;

use ndarray::Array1;
use std::io::Read;
use std::path::Path;
use std::time::Instant;

use crate::data::Sample;
use crate::embeddings::{
    column_index, field, parse_embedding, EmbeddingTable, KeySpec, ResolvedKey,
};
use crate::error::{Error, Result};

/// One row of the training CSV, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingRow {
    /// 1-based line in the source file; the header is line 1.
    pub line: usize,
    pub image_path: String,
    /// Join key for table lookups.
    pub key: String,
    /// Raw inline embedding text, when the file has an embedding column.
    pub embedding: Option<String>,
    /// Set when the CSV record itself could not be read; the row then fails
    /// with this message instead of being decoded.
    pub format_error: Option<String>,
}

impl TrainingRow {
    fn malformed(line: usize, image_path: String, message: String) -> Self {
        Self {
            line,
            key: String::new(),
            image_path,
            embedding: None,
            format_error: Some(message),
        }
    }
}

/// Read every row of a training CSV.
///
/// `embedding_column` of `None` reads no inline vectors; rows must then be
/// joined to a table. A missing column fails the whole read; a malformed
/// record only marks its own row (see [`TrainingRow::format_error`]).
pub fn read_training_rows<R: Read>(
    reader: R,
    image_column: &str,
    key: &KeySpec,
    embedding_column: Option<&str>,
) -> Result<Vec<TrainingRow>> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = rdr.headers()?.clone();

    let columns = RowColumns {
        width: headers.len(),
        image: column_index(&headers, image_column)?,
        key: key.resolve(&headers)?,
        embedding: embedding_column
            .map(|name| column_index(&headers, name))
            .transpose()?,
    };

    let mut rows = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let line = row + 2;

        let record = match record {
            Ok(record) => record,
            Err(err) if err.is_io_error() => return Err(err.into()),
            Err(err) => {
                rows.push(TrainingRow::malformed(line, String::new(), err.to_string()));
                continue;
            }
        };

        let row = columns.parse(&record, line).unwrap_or_else(|message| {
            let image_path = record.get(columns.image).unwrap_or_default().trim();
            TrainingRow::malformed(line, image_path.to_string(), message)
        });
        rows.push(row);
    }

    Ok(rows)
}

/// Header positions of the columns a training row is built from.
struct RowColumns {
    width: usize,
    image: usize,
    key: ResolvedKey,
    embedding: Option<usize>,
}

impl RowColumns {
    fn parse(
        &self,
        record: &csv::StringRecord,
        line: usize,
    ) -> std::result::Result<TrainingRow, String> {
        if record.len() != self.width {
            return Err(format!(
                "line {}: expected {} fields, found {}",
                line,
                self.width,
                record.len()
            ));
        }

        let message = |err: Error| match err {
            Error::DataFormat(message) => message,
            other => other.to_string(),
        };

        let embedding = self
            .embedding
            .map(|idx| field(record, idx, line).map(str::to_string))
            .transpose()
            .map_err(message)?;

        Ok(TrainingRow {
            line,
            image_path: field(record, self.image, line)
                .map_err(message)?
                .trim()
                .to_string(),
            key: self.key.extract(record, line).map_err(message)?,
            embedding,
            format_error: None,
        })
    }
}

pub fn load_training_rows(
    path: &Path,
    image_column: &str,
    key: &KeySpec,
    embedding_column: Option<&str>,
) -> Result<Vec<TrainingRow>> {
    let file = std::fs::File::open(path)?;
    let rows = read_training_rows(file, image_column, key, embedding_column)?;
    tracing::info!(path = %path.display(), rows = rows.len(), "Training rows read");
    Ok(rows)
}

/// Where a row's embedding vector comes from.
#[derive(Debug, Clone, Copy)]
pub enum EmbeddingSource<'a> {
    /// Parsed from the row's own embedding column.
    Inline,
    /// Looked up by the row's key.
    Table(&'a EmbeddingTable),
}

#[derive(Debug)]
pub struct SkippedRow {
    pub line: usize,
    pub image_path: String,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct PreprocessReport {
    pub samples: Vec<Sample>,
    pub skipped: Vec<SkippedRow>,
}

pub struct BatchPreprocessor<'a> {
    image_size: u32,
    embedding_dim: usize,
    source: EmbeddingSource<'a>,
    strategy: ExecutionStrategy,
    strict: bool,
}

impl<'a> BatchPreprocessor<'a> {
    /// Inline embeddings, sequential, lenient.
    pub fn new(image_size: u32, embedding_dim: usize) -> Self {
        Self {
            image_size,
            embedding_dim,
            source: EmbeddingSource::Inline,
            strategy: ExecutionStrategy::Sequential,
            strict: false,
        }
    }

    pub fn with_source(mut self, source: EmbeddingSource<'a>) -> Self {
        self.source = source;
        self
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Abort on the first bad row instead of skipping it.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Produce the sample for a single row.
    ///
    /// The embedding is resolved before the image is decoded so rows with a
    /// bad vector never pay for image I/O.
    pub fn process_row(&self, row: &TrainingRow) -> Result<Sample> {
        if let Some(message) = &row.format_error {
            return Err(Error::DataFormat(message.clone()));
        }

        let embedding = match self.source {
            EmbeddingSource::Inline => {
                let text = row.embedding.as_deref().ok_or_else(|| {
                    Error::DataFormat(format!("line {}: no inline embedding", row.line))
                })?;
                Array1::from(parse_embedding(text)?)
            }
            EmbeddingSource::Table(table) => table.lookup(&row.key)?.to_owned(),
        };

        if embedding.len() != self.embedding_dim {
            return Err(Error::ShapeMismatch {
                a: "embedding vector",
                b: "embedding dim",
                expected: self.embedding_dim,
                got: embedding.len(),
            });
        }

        let image = load_image(Path::new(&row.image_path))?;
        Ok(Sample {
            image_id: row.image_path.clone(),
            image: preprocess_image(&image, self.image_size),
            embedding,
        })
    }

    pub fn run(&self, rows: &[TrainingRow]) -> Result<PreprocessReport> {
        if let EmbeddingSource::Table(table) = self.source {
            if table.dim() != self.embedding_dim {
                return Err(Error::ShapeMismatch {
                    a: "embedding table",
                    b: "embedding dim",
                    expected: self.embedding_dim,
                    got: table.dim(),
                });
            }
        }

        let started = Instant::now();
        let outcomes = self.strategy.map(rows, |row| self.process_row(row))?;

        let mut report = PreprocessReport::default();
        for (row, outcome) in rows.iter().zip(outcomes) {
            match outcome {
                Ok(sample) => report.samples.push(sample),
                Err(err) if !self.strict && err.is_row_recoverable() => {
                    tracing::warn!(line = row.line, path = %row.image_path, error = %err, "Skipping row");
                    report.skipped.push(SkippedRow {
                        line: row.line,
                        image_path: row.image_path.clone(),
                        error: err,
                    });
                }
                Err(err) => {
                    tracing::error!(line = row.line, path = %row.image_path, error = %err, "Preprocessing failed");
                    return Err(err);
                }
            }
        }

        tracing::info!(
            samples = report.samples.len(),
            skipped = report.skipped.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Preprocessing complete"
        );
        Ok(report)
    }
}
