//! Balanced splitting of input lists for two-stage clustering.

/// Split `items` into exactly `k` contiguous chunks whose sizes differ by at
/// most one. Earlier chunks take the remainder. When `items.len() < k` the
/// trailing chunks are empty. `k == 0` yields no chunks.
pub fn balanced_chunks<T>(items: &[T], k: usize) -> Vec<&[T]> {
    if k == 0 {
        return Vec::new();
    }
    let base = items.len() / k;
    let extra = items.len() % k;

    let mut out = Vec::with_capacity(k);
    let mut pos = 0;
    for i in 0..k {
        let size = base + usize::from(i < extra);
        out.push(&items[pos..pos + size]);
        pos += size;
    }
    out
}
