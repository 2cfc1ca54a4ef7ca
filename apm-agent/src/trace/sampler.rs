use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Per-tracer sampling decision source.
///
/// A seed makes the sequence of decisions reproducible, which is what tests
/// rely on. Rates of `1.0` and above always sample and rates of `0.0` and
/// below never sample, without consuming a draw.
pub(crate) struct Sampler {
    rng: Mutex<StdRng>,
}

impl Sampler {
    pub(crate) fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Sampler {
            rng: Mutex::new(rng),
        }
    }

    pub(crate) fn should_sample(&self, rate: f64) -> bool {
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 || rate.is_nan() {
            return false;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.random::<f64>() < rate
    }
}

impl fmt::Debug for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sampler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extremes_do_not_draw() {
        let sampler = Sampler::new(Some(7));
        assert!(sampler.should_sample(1.0));
        assert!(!sampler.should_sample(0.0));
        assert!(!sampler.should_sample(-1.0));

        let mut expected = StdRng::seed_from_u64(7);
        assert_eq!(
            sampler.should_sample(0.5),
            expected.random::<f64>() < 0.5
        );
    }

    #[test]
    fn seeded_sampler_is_reproducible() {
        let a = Sampler::new(Some(42));
        let b = Sampler::new(Some(42));
        let left: Vec<bool> = (0..100).map(|_| a.should_sample(0.3)).collect();
        let right: Vec<bool> = (0..100).map(|_| b.should_sample(0.3)).collect();
        assert_eq!(left, right);
        assert!(left.iter().any(|s| *s));
        assert!(left.iter().any(|s| !*s));
    }
}
