/// Embedding gateway: text in, fixed-length vector out.
///
/// Implementations are thin adapters over an embedding model. The indexing
/// pipeline and the retrieval tools never call them directly; every call is
/// routed through [`AiMiddleware`](crate::ai::middleware::AiMiddleware) so it
/// inherits rate limiting and retry.
pub mod hash;
pub mod ollama;

use async_trait::async_trait;

use crate::ai::ProviderError;

/// Trait for text embedding implementations.
///
/// All implementations must be `Send + Sync` to allow concurrent use
/// behind `Arc`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text string into a vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Return the dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;

    /// Rate-limit key used for calls to this embedder.
    fn provider_key(&self) -> &str;
}

/// Scale `v` to unit length in place. Zero vectors are left alone.
pub fn l2_normalize(v: &mut [f32]) {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    if norm_sq > 0.0 {
        let inv = 1.0 / norm_sq.sqrt();
        for x in v.iter_mut() {
            *x *= inv;
        }
    }
}
