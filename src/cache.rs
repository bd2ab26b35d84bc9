//! Single-slot caches for the quadrature intermediates.
//!
//! The expensive matrices of the engine depend only on the kernel
//! hyperparameters (and, for the candidate cross-covariance, on the
//! candidate point). Each intermediate gets one slot that remembers the
//! key it was computed under; writing a slot evicts whatever was there
//! before, and a lookup under any other key misses. Keys are the raw
//! bit patterns of the floats, so staleness detection is exact and
//! needs no float comparisons.

use nalgebra::DMatrix;

/// Bit-exact cache key derived from hyperparameter values.
pub(crate) type CacheKey = Vec<u64>;

/// Key for results that depend only on the kernel hyperparameters.
pub(crate) fn hyper_key(kernel_params: &[f64]) -> CacheKey {
    kernel_params.iter().map(|p| p.to_bits()).collect()
}

/// Key for results that depend on the hyperparameters and one point.
pub(crate) fn hyper_point_key(kernel_params: &[f64], point: &[f64]) -> CacheKey {
    kernel_params
        .iter()
        .chain(point.iter())
        .map(|p| p.to_bits())
        .collect()
}

/// The cached intermediates of the quadrature engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotKind {
    /// Quadrature cross-covariance rows against the history (`vec_covs`).
    Quadratures,
    /// Posterior mean over the discretization (the `a` vector).
    PosteriorMean,
    /// Quadrature cross-covariance rows against one candidate (`b_new`).
    CandidateCrossCov,
}

#[derive(Debug)]
struct Slot {
    key: CacheKey,
    value: DMatrix<f64>,
}

/// One slot per intermediate, each carrying the key it was filled under.
#[derive(Debug, Default)]
pub(crate) struct QuadratureCache {
    quadratures: Option<Slot>,
    posterior_mean: Option<Slot>,
    candidate_cross_cov: Option<Slot>,
}

impl QuadratureCache {
    fn slot(&self, kind: SlotKind) -> &Option<Slot> {
        match kind {
            SlotKind::Quadratures => &self.quadratures,
            SlotKind::PosteriorMean => &self.posterior_mean,
            SlotKind::CandidateCrossCov => &self.candidate_cross_cov,
        }
    }

    fn slot_mut(&mut self, kind: SlotKind) -> &mut Option<Slot> {
        match kind {
            SlotKind::Quadratures => &mut self.quadratures,
            SlotKind::PosteriorMean => &mut self.posterior_mean,
            SlotKind::CandidateCrossCov => &mut self.candidate_cross_cov,
        }
    }

    /// Look up a slot; misses when empty or filled under a different key.
    pub(crate) fn get(&self, kind: SlotKind, key: &[u64]) -> Option<DMatrix<f64>> {
        self.slot(kind)
            .as_ref()
            .filter(|slot| slot.key == key)
            .map(|slot| slot.value.clone())
    }

    /// Fill a slot, evicting any previous entry regardless of its key.
    pub(crate) fn put(&mut self, kind: SlotKind, key: CacheKey, value: DMatrix<f64>) {
        *self.slot_mut(kind) = Some(Slot { key, value });
    }

    /// Drop all three slots.
    pub(crate) fn clear(&mut self) {
        self.quadratures = None;
        self.posterior_mean = None;
        self.candidate_cross_cov = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(fill: f64) -> DMatrix<f64> {
        DMatrix::from_element(2, 2, fill)
    }

    #[test]
    fn put_then_get_hits_under_the_same_key() {
        let mut cache = QuadratureCache::default();
        let key = hyper_key(&[1.0, 2.0]);
        cache.put(SlotKind::Quadratures, key.clone(), value(1.0));
        assert_eq!(cache.get(SlotKind::Quadratures, &key), Some(value(1.0)));
    }

    #[test]
    fn writing_a_second_key_evicts_the_first() {
        let mut cache = QuadratureCache::default();
        let first = hyper_key(&[1.0, 2.0]);
        let second = hyper_key(&[1.0, 3.0]);
        cache.put(SlotKind::Quadratures, first.clone(), value(1.0));
        cache.put(SlotKind::Quadratures, second.clone(), value(2.0));
        assert_eq!(cache.get(SlotKind::Quadratures, &first), None);
        assert_eq!(cache.get(SlotKind::Quadratures, &second), Some(value(2.0)));
    }

    #[test]
    fn kinds_do_not_share_slots() {
        let mut cache = QuadratureCache::default();
        let key = hyper_key(&[1.0]);
        cache.put(SlotKind::Quadratures, key.clone(), value(1.0));
        assert_eq!(cache.get(SlotKind::PosteriorMean, &key), None);
        assert_eq!(cache.get(SlotKind::CandidateCrossCov, &key), None);
    }

    #[test]
    fn candidate_key_distinguishes_points() {
        let mut cache = QuadratureCache::default();
        let at_a = hyper_point_key(&[1.0, 2.0], &[0.5]);
        let at_b = hyper_point_key(&[1.0, 2.0], &[0.6]);
        cache.put(SlotKind::CandidateCrossCov, at_a.clone(), value(1.0));
        assert_eq!(cache.get(SlotKind::CandidateCrossCov, &at_b), None);
        assert_eq!(cache.get(SlotKind::CandidateCrossCov, &at_a), Some(value(1.0)));
    }

    #[test]
    fn negative_zero_is_a_different_key() {
        assert_ne!(hyper_key(&[0.0]), hyper_key(&[-0.0]));
    }

    #[test]
    fn clear_empties_every_slot() {
        let mut cache = QuadratureCache::default();
        let key = hyper_key(&[1.0]);
        cache.put(SlotKind::Quadratures, key.clone(), value(1.0));
        cache.put(SlotKind::PosteriorMean, key.clone(), value(2.0));
        cache.put(SlotKind::CandidateCrossCov, key.clone(), value(3.0));
        cache.clear();
        assert_eq!(cache.get(SlotKind::Quadratures, &key), None);
        assert_eq!(cache.get(SlotKind::PosteriorMean, &key), None);
        assert_eq!(cache.get(SlotKind::CandidateCrossCov, &key), None);
    }
}
