//! Equal-population binning used for RFM scoring
//!
//! Edges include the minimum and maximum, and any two equal edges make the
//! cut degenerate. Polars' `qcut` only checks the inner breaks, so a column
//! whose lower quantile equals its minimum would still be binned there.

/// Quantile of already-sorted values at probability `q`, interpolating
/// linearly between the two closest ranks.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let fraction = position - lower as f64;
    sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

/// Bin edges splitting `values` into `bins` equal-population buckets.
///
/// Returns `bins + 1` edges, from the minimum to the maximum, or `None` when
/// the values are empty or any two edges coincide (a zero-width bucket).
pub fn quantile_edges(values: &[f64], bins: usize) -> Option<Vec<f64>> {
    if values.is_empty() || bins == 0 {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let edges: Vec<f64> = (0..=bins)
        .map(|i| quantile_sorted(&sorted, i as f64 / bins as f64))
        .collect();

    if edges.windows(2).all(|pair| pair[0] < pair[1]) {
        Some(edges)
    } else {
        None
    }
}

/// Bucket index of each value given ascending `edges`.
///
/// Buckets are closed on the right; the first bucket also holds the
/// minimum edge itself.
pub fn assign_bins(values: &[f64], edges: &[f64]) -> Vec<usize> {
    let inner = edges.get(1..edges.len().saturating_sub(1)).unwrap_or(&[]);
    values
        .iter()
        .map(|&value| inner.iter().filter(|&&edge| value > edge).count())
        .collect()
}

/// Cut `values` into `bins` equal-population buckets, `None` if degenerate.
pub fn qcut(values: &[f64], bins: usize) -> Option<Vec<usize>> {
    quantile_edges(values, bins).map(|edges| assign_bins(values, &edges))
}
