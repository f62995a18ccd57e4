//! Face-embedding similarity index with duplicate-resistant ingestion.
//!
//! The store keeps immutable face records (name, source path, embedding,
//! perceptual hash, timestamp) in SQLite. Ingestion walks an image
//! source, extracts embeddings, and commits every candidate through an
//! atomic duplicate-checked insert, so loading the same library twice
//! never doubles it. On top of the store sit exhaustive similarity
//! search and an offline duplicate sweep.

pub mod config;
pub mod db;
pub mod extract;
pub mod library;
pub mod logging;
pub mod similarity;

pub use config::Config;
pub use db::{DuplicatePair, FaceRecord, FaceStore, IngestOutcome, NewFaceRecord, StoreError};
pub use extract::{DetectedFace, EmbeddingExtractor, PixelEmbedder};
pub use library::{DirSource, ImageSource, LibraryLoader, LoadProgress, LoadReport};
