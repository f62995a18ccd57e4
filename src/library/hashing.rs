//! Perceptual image hashing.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use md5::{Digest, Md5};

const HASH_SIZE: u32 = 32;

/// Average-hash fingerprint of an image, as 32 lowercase hex characters.
///
/// The image is scaled to 32x32 and each pixel reduced to its mean
/// brightness. Every pixel is then compared against the global mean to
/// form a 1024-bit string, which is MD5-hashed. Re-encoded copies of the
/// same picture land on the same hash; unrelated pictures do not.
pub fn perceptual_hash(image: &[u8]) -> Result<String> {
    let decoded =
        image::load_from_memory(image).context("failed to decode image for hashing")?;
    let scaled = decoded
        .resize_exact(HASH_SIZE, HASH_SIZE, FilterType::Triangle)
        .to_rgb8();

    let brightness: Vec<u32> = scaled
        .pixels()
        .map(|p| (p[0] as u32 + p[1] as u32 + p[2] as u32) / 3)
        .collect();
    let mean = brightness.iter().sum::<u32>() / brightness.len() as u32;

    let bits: String = brightness
        .iter()
        .map(|&b| if b > mean { '1' } else { '0' })
        .collect();

    let mut hasher = Md5::new();
    hasher.update(bits.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
