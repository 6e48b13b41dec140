//! Shared fixtures for integration tests.
//!
//! Each test binary compiles its own copy; not every binary uses every
//! helper.
#![allow(dead_code)]

use fathom::{Embedder, EmbedderError};

/// Deterministic 4-dimensional embedder for tests.
///
/// Keyword-driven so tests can steer documents and queries onto known
/// axes; texts containing `unembeddable` fail, simulating a transient
/// model error.
pub struct KeywordEmbedder;

impl Embedder for KeywordEmbedder {
    fn dim(&self) -> usize {
        4
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        if text.contains("unembeddable") {
            return Err(EmbedderError::EmbeddingFailed(
                "model rejected input".to_string(),
            ));
        }
        Ok(if text.contains("alpha") {
            vec![1.0, 0.0, 0.0, 0.0]
        } else if text.contains("beta") {
            vec![0.0, 1.0, 0.0, 0.0]
        } else if text.contains("probe") || text.contains("payload") {
            vec![0.0, 0.0, 1.0, 0.0]
        } else {
            vec![0.0, 0.0, 0.0, 1.0]
        })
    }
}

/// Deterministic unit vector; close seeds give similar vectors.
pub fn sin_vector(seed: u64, dim: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..dim)
        .map(|i| (seed as f32 * 0.1 + i as f32 * 0.01).sin())
        .collect();
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
