//! Per-sample random token permutations.
//!
//! Each forward pass draws one fresh permutation of `[0, tokens)` per sample
//! and its exact inverse. Both are kept as plain `[tokens, batch]` row-major
//! index arrays (token axis outermost) so the reindexer can gather along the
//! token axis directly.
//!
//! Conventions:
//!   forward[i]  = original index of the token now at shuffled position i
//!   backward[j] = shuffled position of original token j
//! so `backward[forward[i]] == i` for every sample.

use rand::seq::SliceRandom;
use rand::Rng;

/// Draw a uniformly random permutation of `0..size` and its inverse.
pub fn random_indexes<R: Rng + ?Sized>(size: usize, rng: &mut R) -> (Vec<usize>, Vec<usize>) {
    let mut forward: Vec<usize> = (0..size).collect();
    forward.shuffle(rng);
    let backward = invert_permutation(&forward);
    (forward, backward)
}

/// Inverse of a permutation (argsort of a permutation of `0..n`).
pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; perm.len()];
    for (pos, &orig) in perm.iter().enumerate() {
        inv[orig] = pos;
    }
    inv
}

/// Forward/backward index pair for a whole batch.
///
/// Layout: `forward[t * batch + b]`, i.e. `[tokens, batch]` row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchIndexes {
    pub forward: Vec<usize>,
    pub backward: Vec<usize>,
    pub tokens: usize,
    pub batch: usize,
}

impl BatchIndexes {
    /// Independent draw per sample. Nothing is shared across the batch.
    pub fn draw<R: Rng + ?Sized>(tokens: usize, batch: usize, rng: &mut R) -> Self {
        let mut forward = vec![0usize; tokens * batch];
        let mut backward = vec![0usize; tokens * batch];
        for b in 0..batch {
            let (fwd, bwd) = random_indexes(tokens, rng);
            for t in 0..tokens {
                forward[t * batch + b] = fwd[t];
                backward[t * batch + b] = bwd[t];
            }
        }
        BatchIndexes { forward, backward, tokens, batch }
    }

    /// Forward permutation of one sample, in shuffled-position order.
    pub fn forward_of(&self, sample: usize) -> Vec<usize> {
        column(&self.forward, self.tokens, self.batch, sample)
    }

    /// Backward permutation of one sample, in original-token order.
    pub fn backward_of(&self, sample: usize) -> Vec<usize> {
        column(&self.backward, self.tokens, self.batch, sample)
    }

    /// Backward indexes widened by one leading row for the summary token:
    /// row 0 is 0 for every sample, every other index is shifted by +1.
    /// Result is `[tokens + 1, batch]`.
    pub fn backward_with_summary(&self) -> Vec<usize> {
        let mut ext = Vec::with_capacity((self.tokens + 1) * self.batch);
        ext.extend(std::iter::repeat(0usize).take(self.batch));
        ext.extend(self.backward.iter().map(|&i| i + 1));
        ext
    }
}

fn column(idx: &[usize], tokens: usize, batch: usize, sample: usize) -> Vec<usize> {
    (0..tokens).map(|t| idx[t * batch + sample]).collect()
}

/// Number of tokens kept visible: `round(tokens * (1 - mask_ratio))`,
/// clamped to `[0, tokens]`.
pub fn visible_count(tokens: usize, mask_ratio: f32) -> usize {
    let keep = (tokens as f64 * (1.0 - mask_ratio as f64)).round();
    if keep <= 0.0 {
        0
    } else {
        (keep as usize).min(tokens)
    }
}
