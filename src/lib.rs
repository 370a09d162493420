//! Contrastive alignment of street-level images with geospatial embeddings.
//!
//! A frozen vision backbone feeds a trainable projection head; a second head
//! projects precomputed location embeddings into the same space. Both heads
//! are trained with a symmetric in-batch contrastive loss, data-parallel over
//! a fixed set of logical devices.

pub mod config;
pub mod data;
pub mod distributed;
pub mod driver;
pub mod embeddings;
pub mod error;
pub mod logging;
pub mod loss;
pub mod model;
pub mod optim;
pub mod preprocess;

pub use error::{Error, Result};
