/// Deterministic feature-hashing embedder.
///
/// Each lowercase word is hashed into one of `dimensions` buckets and the
/// bucket counts are L2-normalized, so texts sharing vocabulary land close
/// together. No model download is needed, which makes it the test backend
/// and the offline default.
use async_trait::async_trait;

use super::{Embedder, l2_normalize};
use crate::ai::ProviderError;

pub struct HashEmbedder {
    pub dimensions: usize,
}

impl HashEmbedder {
    /// Create a new `HashEmbedder` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    /// Synchronous core of [`Embedder::embed`].
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];
        if self.dimensions == 0 {
            return embedding;
        }

        let mut any = false;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = self.bucket(&token.to_lowercase());
            embedding[bucket] += 1.0;
            any = true;
        }

        // Punctuation-only or empty input still needs a non-zero vector
        if !any {
            let bucket = self.bucket(text.trim());
            embedding[bucket] = 1.0;
        }

        l2_normalize(&mut embedding);
        embedding
    }

    fn bucket(&self, token: &str) -> usize {
        // md5 keeps buckets stable across toolchains, unlike std's hasher
        let digest = md5::compute(token.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.0[..8]);
        (u64::from_le_bytes(bytes) % self.dimensions as u64) as usize
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dimensions: 384 }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_key(&self) -> &str {
        "embedding:hash"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_hash_embed_dimensions() {
        let embedder = HashEmbedder::new(384);
        let result = embedder.embed("hello world").await.unwrap();
        assert_eq!(result.len(), 384);
    }

    #[test]
    fn test_hash_embed_deterministic() {
        let embedder = HashEmbedder::new(384);
        let a = embedder.embed_sync("hello");
        let b = embedder.embed_sync("hello");
        assert_eq!(a, b, "same input should produce same output");
    }

    #[test]
    fn test_hash_embed_case_insensitive() {
        let embedder = HashEmbedder::new(384);
        assert_eq!(embedder.embed_sync("Hello"), embedder.embed_sync("hello"));
    }

    #[test]
    fn test_hash_embed_different_inputs() {
        let embedder = HashEmbedder::new(384);
        let a = embedder.embed_sync("hello");
        let b = embedder.embed_sync("world");
        assert_ne!(a, b, "different inputs should produce different outputs");
    }

    #[test]
    fn test_hash_embed_normalized() {
        let embedder = HashEmbedder::new(384);
        let vec = embedder.embed_sync("test normalization");
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!(
            (norm - 1.0).abs() < 0.01,
            "vector should be approximately unit length, got {norm}"
        );
    }

    #[test]
    fn test_shared_vocabulary_is_closer() {
        let embedder = HashEmbedder::new(384);
        let q = embedder.embed_sync("rust ownership rules");
        let near = embedder.embed_sync("The rules of ownership in Rust");
        let far = embedder.embed_sync("banana bread recipe");
        assert!(cosine(&q, &near) > cosine(&q, &far));
    }

    #[test]
    fn test_punctuation_only_is_nonzero() {
        let embedder = HashEmbedder::new(16);
        let v = embedder.embed_sync("!!! ---");
        assert!(v.iter().any(|x| *x > 0.0));
    }

    #[test]
    fn test_hash_default_dimensions() {
        let embedder = HashEmbedder::default();
        assert_eq!(embedder.dimensions(), 384);
    }
}
