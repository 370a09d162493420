//! Precomputed geospatial embeddings keyed by image identifier.
//!
//! Vectors come from a CSV export: either keyed by an image path column
//! (`image_path,embedding`) or by coordinates (`longitude,latitude,embedding`).
//! The embedding column holds a textual list such as `[0.12, -0.4, ...]`.

mod parse;
mod table;

pub use parse::parse_embedding;
pub use table::{EmbeddingTable, KeySpec};
pub(crate) use table::{column_index, field, ResolvedKey};
