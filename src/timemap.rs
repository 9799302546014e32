use anyhow::{bail, Context, Result};
use std::path::Path;

/// Piecewise-linear mapping between two independent clock domains, anchored
/// by a curated set of matched-event timestamps (seconds since epoch).
///
/// Lookups outside the anchored span return `None` rather than an
/// extrapolated guess: a timestamp outside the calibrated range cannot be
/// trusted, and callers skip the frame instead of mis-geotagging it.
#[derive(Debug, Clone)]
pub struct TimeMap {
    source: Vec<f64>,
    target: Vec<f64>,
    source_bounds: (f64, f64),
    target_bounds: (f64, f64),
}

impl TimeMap {
    /// Build a map from (source, target) anchor pairs. The pairs need not
    /// arrive sorted; they are ordered by source time internally.
    ///
    /// Duplicate or non-finite source values are rejected, as are target
    /// values that are not strictly increasing once source-sorted: the
    /// reverse lookup interpolates over the target axis and needs it
    /// monotonic to be well-defined.
    pub fn new(mut anchors: Vec<(f64, f64)>) -> Result<Self> {
        if anchors.len() < 2 {
            bail!("time map needs at least 2 anchor pairs, got {}", anchors.len());
        }
        for (s, t) in &anchors {
            if !s.is_finite() || !t.is_finite() {
                bail!("non-finite anchor pair ({s}, {t})");
            }
        }

        anchors.sort_by(|a, b| a.0.total_cmp(&b.0));

        for w in anchors.windows(2) {
            if w[1].0 <= w[0].0 {
                bail!("duplicate or non-increasing source anchor {}", w[1].0);
            }
            if w[1].1 <= w[0].1 {
                bail!("target anchors not strictly increasing at {}", w[1].1);
            }
        }

        let source: Vec<f64> = anchors.iter().map(|a| a.0).collect();
        let target: Vec<f64> = anchors.iter().map(|a| a.1).collect();
        let source_bounds = (source[0], *source.last().unwrap());
        let target_bounds = (target[0], *target.last().unwrap());

        Ok(TimeMap { source, target, source_bounds, target_bounds })
    }

    /// Load anchors from a two-column `source,target` CSV file.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_path(path)
            .with_context(|| format!("reading anchor file {}", path.display()))?;

        let mut anchors = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.len() < 2 {
                bail!("anchor row needs two columns, got {}", record.len());
            }
            let s: f64 = record[0].parse().context("source anchor column")?;
            let t: f64 = record[1].parse().context("target anchor column")?;
            anchors.push((s, t));
        }
        Self::new(anchors)
    }

    /// Map a source-domain timestamp to the target domain, or `None` if it
    /// lies outside the anchored span.
    pub fn forward(&self, t: f64) -> Option<f64> {
        if t < self.source_bounds.0 || t > self.source_bounds.1 {
            return None;
        }
        Some(interp_sorted(t, &self.source, &self.target))
    }

    /// Map a target-domain timestamp back to the source domain, or `None`
    /// if it lies outside the anchored span.
    pub fn reverse(&self, t: f64) -> Option<f64> {
        if t < self.target_bounds.0 || t > self.target_bounds.1 {
            return None;
        }
        Some(interp_sorted(t, &self.target, &self.source))
    }
}

/// Linear interpolation of `x` against sorted `xs` with values `ys`,
/// clamped to the end values outside the range.
pub fn interp_sorted(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    debug_assert!(!xs.is_empty());

    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[xs.len() - 1] {
        return ys[ys.len() - 1];
    }
    let i = match xs.binary_search_by(|v| v.total_cmp(&x)) {
        Ok(i) => return ys[i],
        Err(i) => i,
    };
    let (x0, x1) = (xs[i - 1], xs[i]);
    let (y0, y1) = (ys[i - 1], ys[i]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}
