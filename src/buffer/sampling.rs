//! Mini-batch partitioning of a flattened rollout

use rand::{Rng, seq::SliceRandom};

/// Shuffle `0..n` and split it into `n_mini_batches` groups
///
/// The number of groups is clamped to `1..=n`. Every group holds `n / k`
/// samples except the last one, which also takes the `n % k` leftovers, so
/// no sample is ever dropped and group sizes do not change between calls.
///
/// # Arguments
/// * `n` - Total number of samples (time steps x environments)
/// * `n_mini_batches` - Requested number of groups
/// * `rng` - Shuffling source; callers reuse it so every epoch reshuffles
pub fn minibatch_indices<R: Rng + ?Sized>(
    n: usize,
    n_mini_batches: usize,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    if n == 0 {
        return Vec::new();
    }
    let k = n_mini_batches.clamp(1, n);
    let size = n / k;

    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);

    let mut batches = Vec::with_capacity(k);
    for b in 0..k {
        let start = b * size;
        let end = if b + 1 == k { n } else { start + size };
        batches.push(indices[start..end].to_vec());
    }
    batches
}
