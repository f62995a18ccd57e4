//! Face embedding extraction.

use anyhow::{Context, Result};
use image::imageops::FilterType;

/// One face found in an image, with the vector that describes it.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// Turns raw image bytes into face embeddings. Implementations decide
/// what counts as a face; an empty vec means none were found.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>>;
}

pub const EMBED_SIZE: u32 = 96;

/// Embedder that treats the whole frame as a single face: scale to
/// 96x96 and emit normalized RGB intensities as a 27648-dim vector.
///
/// This is not a recognition model. It keeps the index usable without
/// model weights and fixes the shape real extractors plug into.
pub struct PixelEmbedder;

impl EmbeddingExtractor for PixelEmbedder {
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>> {
        let decoded = image::load_from_memory(image).context("failed to decode image")?;
        let scaled = decoded
            .resize_exact(EMBED_SIZE, EMBED_SIZE, FilterType::Triangle)
            .to_rgb8();

        let mut embedding = Vec::with_capacity((EMBED_SIZE * EMBED_SIZE * 3) as usize);
        for pixel in scaled.pixels() {
            embedding.push(pixel[0] as f32 / 255.0);
            embedding.push(pixel[1] as f32 / 255.0);
            embedding.push(pixel[2] as f32 / 255.0);
        }

        Ok(vec![DetectedFace {
            embedding,
            confidence: 1.0,
        }])
    }
}
