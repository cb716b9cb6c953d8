//! Move scheduling.

use crate::random::RandomNumberGenerator;

/// Picks moves at random with probability proportional to their weight.
///
/// One generation performs as many moves as the weights sum to (rounded,
/// at least one).
#[derive(Debug, Clone)]
pub struct RandomMoveSchedule {
    cumulative: Vec<f64>,
    total: f64,
}

impl RandomMoveSchedule {
    /// Build a schedule from move weights. Negative or non-finite weights
    /// count as zero.
    pub fn new(weights: &[f64]) -> Self {
        let mut total = 0.0;
        let cumulative = weights
            .iter()
            .map(|&w| {
                if w.is_finite() && w > 0.0 {
                    total += w;
                }
                total
            })
            .collect();
        Self { cumulative, total }
    }

    pub fn moves_per_generation(&self) -> usize {
        (self.total.round() as usize).max(1)
    }

    /// Index of the next move, or `None` if every weight is zero.
    pub fn next_move(&self, rng: &mut RandomNumberGenerator) -> Option<usize> {
        if self.total <= 0.0 {
            return None;
        }
        let u = rng.uniform01() * self.total;
        self.cumulative
            .iter()
            .position(|&c| u < c)
            .or(Some(self.cumulative.len() - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_in_proportion_to_weight() {
        let schedule = RandomMoveSchedule::new(&[1.0, 3.0]);
        assert_eq!(schedule.moves_per_generation(), 4);

        let mut rng = RandomNumberGenerator::new(12);
        let n = 40_000;
        let mut counts = [0usize; 2];
        for _ in 0..n {
            counts[schedule.next_move(&mut rng).unwrap()] += 1;
        }
        let share = counts[1] as f64 / n as f64;
        assert!((share - 0.75).abs() < 0.01, "share {share}");
    }

    #[test]
    fn zero_weights_are_never_picked() {
        let schedule = RandomMoveSchedule::new(&[0.0, 2.0, -1.0]);
        let mut rng = RandomNumberGenerator::new(12);
        for _ in 0..1000 {
            assert_eq!(schedule.next_move(&mut rng), Some(1));
        }
        assert_eq!(RandomMoveSchedule::new(&[0.0]).next_move(&mut rng), None);
        assert_eq!(RandomMoveSchedule::new(&[]).moves_per_generation(), 1);
    }
}
