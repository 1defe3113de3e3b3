//! Test RNGs: deterministic `DeterministicRng` implementations for tests.

use docreview_core::rng::DeterministicRng;

/// An RNG that always returns `min` and `0.0`, i.e. retry schedules without
/// jitter.
#[derive(Debug)]
pub struct MockRng;

impl DeterministicRng for MockRng {
    fn next_u32_range(&mut self, min: u32, _max: u32) -> u32 {
        min
    }

    fn next_f64(&mut self) -> f64 {
        0.0
    }
}

/// An RNG that returns fractions from a predetermined sequence, cycling when
/// exhausted. Used to pin jitter in backoff tests.
#[derive(Debug)]
pub struct SequenceRng {
    values: Vec<f64>,
    index: usize,
}

impl SequenceRng {
    /// Create a new `SequenceRng` with the given fractions in `[0.0, 1.0)`.
    #[must_use]
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, index: 0 }
    }
}

impl DeterministicRng for SequenceRng {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn next_u32_range(&mut self, min: u32, max: u32) -> u32 {
        let span = f64::from(max.saturating_sub(min));
        min + (self.next_f64() * span).round() as u32
    }

    fn next_f64(&mut self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let value = self.values[self.index % self.values.len()];
        self.index += 1;
        value
    }
}
