//! Prompt continuity cache for in-process models.
//!
//! Each turn the full conversation is re-templated into tokens. The tokens
//! already processed into the model's per-layer KV cache are remembered, so
//! only the part of the new prompt after the longest common prefix needs to be
//! computed. Matching is exact on token ids: reuse must never change output.

/// Token id as produced by the model's tokenizer.
pub type TokenId = u32;

/// One per-layer cache structure of a model.
///
/// Whether a layer can be shortened depends on the backend (rotating or
/// quantized caches often cannot), so it is queried, never assumed.
pub trait LayerCache {
    /// Number of token positions currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_trimmable(&self) -> bool;

    /// Drop the last `n` positions. Returns how many were actually removed.
    fn trim(&mut self, n: usize) -> usize;
}

/// Outcome of [`PromptCache::reconcile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The first `prefix_len` tokens are served from the cache; `uncached`
    /// must be processed. The remembered tokens already include `uncached`.
    Reused {
        prefix_len: usize,
        uncached: Vec<TokenId>,
    },
    /// The cache could not be shortened to the common prefix. Its tokens were
    /// forgotten; install fresh layers with [`PromptCache::replace`] and
    /// process the whole prompt.
    Invalidated,
}

/// Length of the longest common prefix of two token sequences.
pub fn common_prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Remembered prompt tokens plus the model cache they were processed into.
#[derive(Debug)]
pub struct PromptCache<L> {
    tokens: Vec<TokenId>,
    layers: Vec<L>,
}

impl<L: LayerCache> PromptCache<L> {
    pub fn new(layers: Vec<L>) -> Self {
        Self {
            tokens: Vec::new(),
            layers,
        }
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn layers(&self) -> &[L] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [L] {
        &mut self.layers
    }

    /// Replace the model cache wholesale, forgetting every remembered token.
    pub fn replace(&mut self, layers: Vec<L>) {
        self.tokens.clear();
        self.layers = layers;
    }

    /// Record tokens that were fed into the layers outside of `reconcile`
    /// (generated tokens).
    pub fn extend(&mut self, tokens: &[TokenId]) {
        self.tokens.extend_from_slice(tokens);
    }

    /// Work out which part of `prompt` still has to be computed.
    pub fn reconcile(&mut self, prompt: &[TokenId]) -> Reconciliation {
        let cached = self.tokens.len();
        let prefix_len = common_prefix_len(&self.tokens, prompt);

        if prefix_len < cached {
            if !self.trim_to(prefix_len) {
                tracing::debug!(cached, prefix_len, "prompt cache not trimmable, invalidating");
                self.tokens.clear();
                return Reconciliation::Invalidated;
            }
            tracing::debug!(cached, prefix_len, "prompt cache trimmed to common prefix");
        }

        let uncached = prompt[prefix_len..].to_vec();
        self.tokens.extend_from_slice(&uncached);
        Reconciliation::Reused {
            prefix_len,
            uncached,
        }
    }

    /// Shorten remembered tokens and every layer to `len` positions.
    /// Returns `false` if any layer refused; the cache is then inconsistent
    /// and must be replaced.
    pub fn trim_to(&mut self, len: usize) -> bool {
        if len > self.tokens.len() {
            return false;
        }
        if self.layers.iter().any(|layer| !layer.is_trimmable()) {
            return false;
        }
        let excess = self.tokens.len() - len;
        for layer in &mut self.layers {
            let target = layer.len().saturating_sub(excess);
            let want = layer.len() - target;
            if layer.trim(want) != want {
                return false;
            }
        }
        self.tokens.truncate(len);
        true
    }
}
