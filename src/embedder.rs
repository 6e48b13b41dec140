//! Embedding provider interface.
//!
//! The engine never runs a model itself; callers wire in anything that can
//! turn text into fixed-length vectors (an ONNX session, an HTTP client, a
//! lookup table in tests). The trait is object-safe so the coordinator can
//! hold `Arc<dyn Embedder>`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),
    #[error("Query cannot be empty")]
    EmptyQuery,
    #[error("Dimension mismatch: embedder produced {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Progress callback for batch embedding: `(done, total)`.
pub type EmbedProgress<'a> = &'a (dyn Fn(usize, usize) + Sync);

/// Text-to-vector provider.
///
/// Implementations must be idempotent over identical input text and
/// thread-safe; the coordinator calls `embed` outside any index lock, so a
/// slow model never blocks readers.
pub trait Embedder: Send + Sync {
    /// Output dimensionality. Must match the vector layer's configured
    /// dimensions.
    fn dim(&self) -> usize;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    /// Embed a batch of texts, reporting progress after each item.
    ///
    /// The default implementation maps `embed` over the slice; providers
    /// with real batch inference should override it.
    fn embed_batch(
        &self,
        texts: &[&str],
        on_progress: Option<EmbedProgress<'_>>,
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let total = texts.len();
        let mut out = Vec::with_capacity(total);
        for (i, text) in texts.iter().enumerate() {
            out.push(self.embed(text)?);
            if let Some(progress) = on_progress {
                progress(i + 1, total);
            }
        }
        Ok(out)
    }
}

/// Compute the L2 norm of a vector.
pub(crate) fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Unit-normalize a vector in place when its norm drifts more than `1e-2`
/// from 1.0. Returns `false` for zero-norm vectors, which cannot be
/// normalized.
pub(crate) fn normalize_in_place(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    if (norm - 1.0).abs() > 1e-2 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    true
}

/// Cosine similarity between two equal-length vectors.
///
/// Returns `None` when either vector has zero norm or lengths differ.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    Some(dot / (na.sqrt() * nb.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder;

    impl Embedder for FixedEmbedder {
        fn dim(&self) -> usize {
            4
        }
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
            if text.is_empty() {
                return Err(EmbedderError::EmptyQuery);
            }
            Ok(vec![1.0, 0.0, 0.0, 0.0])
        }
    }

    #[test]
    fn test_embed_batch_default_impl_reports_progress() {
        let embedder = FixedEmbedder;
        let seen = std::sync::Mutex::new(Vec::new());
        let progress = |done: usize, total: usize| {
            seen.lock().unwrap().push((done, total));
        };
        let out = embedder
            .embed_batch(&["a", "b", "c"], Some(&progress))
            .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn test_embed_batch_propagates_errors() {
        let embedder = FixedEmbedder;
        let result = embedder.embed_batch(&["a", ""], None);
        assert!(result.is_err());
    }

    #[test]
    fn test_normalize_in_place_skips_near_unit() {
        let mut v = vec![1.0f32, 0.0, 0.0];
        assert!(normalize_in_place(&mut v));
        assert_eq!(v, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_normalize_in_place_scales_long_vector() {
        let mut v = vec![3.0f32, 4.0, 0.0];
        assert!(normalize_in_place(&mut v));
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_rejects_zero_vector() {
        let mut v = vec![0.0f32; 3];
        assert!(!normalize_in_place(&mut v));
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_norm_is_none() {
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).is_none());
    }

    #[test]
    fn test_cosine_similarity_length_mismatch_is_none() {
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_none());
    }
}
