//! Snapshot comparison.
//!
//! Screenshots are compared perceptually: two 64-bit hashes (average hash and
//! difference hash) per image, judged equal when every variant is within a
//! normalized Hamming distance threshold. Hierarchy text is compared exactly
//! through a SHA-256 content fingerprint.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default normalized Hamming distance under which images count as equal
pub const DEFAULT_IMAGE_THRESHOLD: f64 = 0.1;

const HASH_BITS: f64 = 64.0;

/// Perceptual hash variants of one screenshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFingerprint {
    pub ahash: u64,
    pub dhash: u64,
}

impl ImageFingerprint {
    /// Decode an encoded image (PNG, JPEG, ...) and hash it
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let img = image::load_from_memory(bytes).context("Failed to decode screenshot")?;
        let ahash = average_hash(&img.resize_exact(8, 8, FilterType::Triangle).to_luma8());
        let dhash = difference_hash(&img.resize_exact(9, 8, FilterType::Triangle).to_luma8());
        Ok(Self { ahash, dhash })
    }

    /// Largest normalized Hamming distance across the hash variants
    pub fn distance(&self, other: &Self) -> f64 {
        let a = (self.ahash ^ other.ahash).count_ones() as f64 / HASH_BITS;
        let d = (self.dhash ^ other.dhash).count_ones() as f64 / HASH_BITS;
        a.max(d)
    }

    pub fn is_similar(&self, other: &Self, threshold: f64) -> bool {
        self.distance(other) <= threshold
    }
}

fn average_hash(pixels: &GrayImage) -> u64 {
    let total: u64 = pixels.pixels().map(|p| p.0[0] as u64).sum();
    let mean = total / (pixels.width() * pixels.height()).max(1) as u64;
    pixels
        .pixels()
        .enumerate()
        .fold(0u64, |hash, (i, p)| {
            if p.0[0] as u64 > mean {
                hash | (1 << i)
            } else {
                hash
            }
        })
}

fn difference_hash(pixels: &GrayImage) -> u64 {
    let mut hash = 0u64;
    let mut bit = 0;
    for y in 0..pixels.height() {
        for x in 0..pixels.width() - 1 {
            let left = pixels.get_pixel(x, y).0[0];
            let right = pixels.get_pixel(x + 1, y).0[0];
            if left > right {
                hash |= 1 << bit;
            }
            bit += 1;
        }
    }
    hash
}

/// Exact content fingerprint of a view hierarchy
pub fn hierarchy_fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Judges whether two screenshots show the same screen
#[derive(Debug, Clone, Copy)]
pub struct SnapshotComparator {
    threshold: f64,
}

impl Default for SnapshotComparator {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_THRESHOLD)
    }
}

impl SnapshotComparator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn fingerprint(&self, image: &[u8]) -> Result<ImageFingerprint> {
        ImageFingerprint::from_bytes(image)
    }

    pub fn are_equal(&self, a: &ImageFingerprint, b: &ImageFingerprint) -> bool {
        a.is_similar(b, self.threshold)
    }

    /// Compare two encoded screenshots.
    ///
    /// Images that fail to decode are only equal when byte-identical.
    pub fn images_equal(&self, a: &[u8], b: &[u8]) -> bool {
        match (self.fingerprint(a), self.fingerprint(b)) {
            (Ok(fa), Ok(fb)) => self.are_equal(&fa, &fb),
            _ => a == b,
        }
    }
}
