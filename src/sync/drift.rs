// src/sync/drift.rs

use crate::stem::StemId;

/// Result of one drift pass.
#[derive(Clone, Debug, PartialEq)]
pub struct DriftPlan {
    /// Mean of every sampled position; the re-seek target.
    pub mean: f64,
    /// Engines further than the tolerance from the mean.
    pub reseek: Vec<StemId>,
}

impl DriftPlan {
    pub fn is_noop(&self) -> bool {
        self.reseek.is_empty()
    }
}

/// Decide which engines to pull back to the consensus position.
/// `None` when there is nothing to compare.
pub fn plan_corrections(samples: &[(StemId, f64)], tolerance: f64) -> Option<DriftPlan> {
    if samples.is_empty() {
        return None;
    }
    let mean = samples.iter().map(|(_, p)| p).sum::<f64>() / samples.len() as f64;
    let reseek = samples
        .iter()
        .filter(|(_, p)| (p - mean).abs() > tolerance)
        .map(|(id, _)| id.clone())
        .collect();
    Some(DriftPlan { mean, reseek })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(positions: &[(&str, f64)]) -> Vec<(StemId, f64)> {
        positions.iter().map(|(id, p)| (StemId::new(*id), *p)).collect()
    }

    #[test]
    fn reseeks_outliers_to_mean() {
        let plan = plan_corrections(&samples(&[("a", 10.00), ("b", 10.08), ("c", 9.90)]), 0.05).unwrap();
        assert!((plan.mean - 9.99333).abs() < 1e-4);
        assert_eq!(plan.reseek, vec![StemId::new("b"), StemId::new("c")]);
    }

    #[test]
    fn leaves_aligned_engines_alone() {
        let plan = plan_corrections(&samples(&[("a", 10.00), ("b", 10.02), ("c", 9.99)]), 0.05).unwrap();
        assert!(plan.is_noop());
    }

    #[test]
    fn single_engine_never_drifts() {
        let plan = plan_corrections(&samples(&[("a", 42.0)]), 0.05).unwrap();
        assert_eq!(plan.mean, 42.0);
        assert!(plan.is_noop());
        assert!(plan_corrections(&[], 0.05).is_none());
    }
}
