use ndarray::{Array2, ArrayView1};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use super::parse_embedding;
use crate::error::{Error, Result};

/// How the record key is derived from a table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySpec {
    /// The key is the value of a single column, e.g. `image_path`.
    Column(String),
    /// The key is `"{longitude},{latitude}"` built from two columns.
    Coordinates { longitude: String, latitude: String },
}

impl KeySpec {
    pub fn image_path() -> Self {
        KeySpec::Column("image_path".to_string())
    }

    pub fn coordinates() -> Self {
        KeySpec::Coordinates {
            longitude: "longitude".to_string(),
            latitude: "latitude".to_string(),
        }
    }

    /// Key for a coordinate pair, in the form coordinate-keyed tables use.
    ///
    /// Each side that parses as a number is written in its shortest form, so
    /// `37.70`, `37.7` and `3.77e1` give the same key. Anything else is kept
    /// as trimmed text.
    pub fn coordinate_key(longitude: &str, latitude: &str) -> String {
        format!(
            "{},{}",
            canonical_coordinate(longitude),
            canonical_coordinate(latitude)
        )
    }

    /// Bind the key columns to their positions in a header row.
    pub(crate) fn resolve(&self, headers: &csv::StringRecord) -> Result<ResolvedKey> {
        Ok(match self {
            KeySpec::Column(name) => ResolvedKey::Column(column_index(headers, name)?),
            KeySpec::Coordinates { longitude, latitude } => ResolvedKey::Coordinates(
                column_index(headers, longitude)?,
                column_index(headers, latitude)?,
            ),
        })
    }
}

/// A [`KeySpec`] bound to column positions.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ResolvedKey {
    Column(usize),
    Coordinates(usize, usize),
}

impl ResolvedKey {
    pub(crate) fn extract(&self, record: &csv::StringRecord, line: usize) -> Result<String> {
        match *self {
            ResolvedKey::Column(idx) => Ok(field(record, idx, line)?.trim().to_string()),
            ResolvedKey::Coordinates(lon, lat) => Ok(KeySpec::coordinate_key(
                field(record, lon, line)?,
                field(record, lat, line)?,
            )),
        }
    }
}

fn canonical_coordinate(text: &str) -> String {
    let text = text.trim();
    match text.parse::<f64>() {
        // -0 and 0 are the same place.
        Ok(value) if value == 0.0 => "0".to_string(),
        Ok(value) if value.is_finite() => value.to_string(),
        _ => text.to_string(),
    }
}

pub(crate) fn column_index(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or_else(|| Error::DataFormat(format!("required column `{}` is absent", name)))
}

pub(crate) fn field(record: &csv::StringRecord, idx: usize, line: usize) -> Result<&str> {
    record
        .get(idx)
        .ok_or_else(|| Error::DataFormat(format!("line {}: missing field {}", line, idx)))
}

/// Immutable mapping from image identifier to a fixed-length vector.
///
/// Vectors are stored row-wise in one contiguous matrix in load order; the
/// hash index maps each id to its row.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    vectors: Array2<f32>,
}

impl EmbeddingTable {
    /// Load a table from a CSV file.
    pub fn load(path: &Path, key: &KeySpec, embedding_column: &str, dim: usize) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(file, key, embedding_column, dim)?;
        tracing::info!(
            path = %path.display(),
            records = table.len(),
            dim,
            "Embedding table loaded"
        );
        Ok(table)
    }

    /// Load a table from any CSV source with a header row.
    pub fn from_reader<R: Read>(
        reader: R,
        key: &KeySpec,
        embedding_column: &str,
        dim: usize,
    ) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let headers = rdr.headers()?.clone();
        let key = key.resolve(&headers)?;
        let embedding_idx = column_index(&headers, embedding_column)?;

        let mut records = Vec::new();
        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            // Header is line 1.
            let line = row + 2;

            let id = key.extract(&record, line)?;
            let vector = parse_embedding(field(&record, embedding_idx, line)?)
                .map_err(|e| Error::DataFormat(format!("line {}: {}", line, e)))?;

            records.push((id, vector));
        }

        Self::from_records(records, dim)
    }

    /// Build a table from in-memory records.
    ///
    /// Fails with `DataFormat` on a duplicate id or a vector whose length is not `dim`.
    pub fn from_records<I>(records: I, dim: usize) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Vec<f32>)>,
    {
        let mut ids = Vec::new();
        let mut index = HashMap::new();
        let mut flat = Vec::new();

        for (id, vector) in records {
            if vector.len() != dim {
                return Err(Error::DataFormat(format!(
                    "embedding for `{}` has {} values, expected {}",
                    id,
                    vector.len(),
                    dim
                )));
            }
            if index.contains_key(&id) {
                return Err(Error::DataFormat(format!("duplicate image id `{}`", id)));
            }

            index.insert(id.clone(), ids.len());
            ids.push(id);
            flat.extend(vector);
        }

        let vectors = Array2::from_shape_vec((ids.len(), dim), flat)
            .map_err(|e| Error::DataFormat(e.to_string()))?;

        Ok(Self { ids, index, vectors })
    }

    /// Exact-key lookup. Never substitutes another record on a miss.
    pub fn lookup(&self, image_id: &str) -> Result<ArrayView1<'_, f32>> {
        self.index
            .get(image_id)
            .map(|&row| self.vectors.row(row))
            .ok_or_else(|| Error::Lookup(image_id.to_string()))
    }

    pub fn contains(&self, image_id: &str) -> bool {
        self.index.contains_key(image_id)
    }

    /// Ids in load order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ArrayView1<'_, f32>)> {
        self.ids
            .iter()
            .zip(self.vectors.rows())
            .map(|(id, row)| (id.as_str(), row))
    }

    pub fn dim(&self) -> usize {
        self.vectors.ncols()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
