//! Token selection from the final position's logits.

use crate::sequence::TokenId;
use ndarray::ArrayView1;

/// Maps a logits row (plus the tokens so far) to exactly one token id.
pub trait DecodingPolicy: Send {
    fn name(&self) -> &'static str;

    fn select(&mut self, logits: ArrayView1<'_, f32>, history: &[TokenId]) -> TokenId;
}

/// Index of the largest logit, lowest index on ties. NaN never wins; an
/// all-NaN row yields 0.
pub fn argmax(logits: ArrayView1<'_, f32>) -> TokenId {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in logits.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, best_value)) if value <= best_value => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map_or(0, |(idx, _)| idx as TokenId)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyPolicy;

impl DecodingPolicy for GreedyPolicy {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn select(&mut self, logits: ArrayView1<'_, f32>, _history: &[TokenId]) -> TokenId {
        argmax(logits)
    }
}

/// Temperature sampling with optional top-k truncation.
pub struct TemperaturePolicy {
    temperature: f32,
    top_k: Option<usize>,
    rng: fastrand::Rng,
}

impl TemperaturePolicy {
    pub fn new(temperature: f32, top_k: Option<usize>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self {
            temperature,
            top_k: top_k.filter(|&k| k > 0),
            rng,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < 1e-5
    }
}

impl DecodingPolicy for TemperaturePolicy {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn select(&mut self, logits: ArrayView1<'_, f32>, _history: &[TokenId]) -> TokenId {
        if self.is_greedy() {
            return argmax(logits);
        }

        let mut candidates: Vec<(usize, f32)> = logits
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(idx, &v)| (idx, v))
            .collect();
        if candidates.is_empty() {
            return argmax(logits);
        }
        // Stable sort keeps the lower index first among equal logits.
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        if let Some(k) = self.top_k {
            candidates.truncate(k);
        }

        let max = candidates[0].1;
        let weights: Vec<f32> = candidates
            .iter()
            .map(|&(_, v)| ((v - max) / self.temperature).exp())
            .collect();
        let total: f32 = weights.iter().sum();

        let target = self.rng.f32() * total;
        let mut cumsum = 0.0;
        for (&(idx, _), weight) in candidates.iter().zip(&weights) {
            cumsum += weight;
            if target < cumsum {
                return idx as TokenId;
            }
        }
        candidates[candidates.len() - 1].0 as TokenId
    }
}

/// Adapts a closure into a policy.
pub struct FnPolicy<F> {
    name: &'static str,
    f: F,
}

pub fn policy_fn<F>(name: &'static str, f: F) -> FnPolicy<F>
where
    F: FnMut(ArrayView1<'_, f32>, &[TokenId]) -> TokenId + Send,
{
    FnPolicy { name, f }
}

impl<F> DecodingPolicy for FnPolicy<F>
where
    F: FnMut(ArrayView1<'_, f32>, &[TokenId]) -> TokenId + Send,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn select(&mut self, logits: ArrayView1<'_, f32>, history: &[TokenId]) -> TokenId {
        (self.f)(logits, history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn argmax_prefers_lowest_index_on_tie() {
        let logits = array![0.1f32, 3.0, 2.0, 3.0];
        assert_eq!(argmax(logits.view()), 1);
    }

    #[test]
    fn argmax_skips_nan() {
        let logits = array![f32::NAN, -1.0, -2.0];
        assert_eq!(argmax(logits.view()), 1);
        assert_eq!(argmax(array![f32::NAN, f32::NAN].view()), 0);
    }

    #[test]
    fn zero_temperature_is_greedy() {
        let mut policy = TemperaturePolicy::new(0.0, None, Some(7));
        assert!(policy.is_greedy());
        assert_eq!(policy.select(array![1.0f32, 5.0, 5.0].view(), &[]), 1);
    }

    #[test]
    fn top_one_sampling_is_deterministic() {
        let mut policy = TemperaturePolicy::new(1.5, Some(1), None);
        for _ in 0..16 {
            assert_eq!(policy.select(array![0.0f32, 0.5, 4.0, 1.0].view(), &[]), 2);
        }
    }

    #[test]
    fn seeded_sampling_repeats() {
        let logits = array![1.0f32, 1.2, 0.8, 1.1];
        let mut a = TemperaturePolicy::new(1.0, None, Some(42));
        let mut b = TemperaturePolicy::new(1.0, None, Some(42));
        let run_a: Vec<_> = (0..32).map(|_| a.select(logits.view(), &[])).collect();
        let run_b: Vec<_> = (0..32).map(|_| b.select(logits.view(), &[])).collect();
        assert_eq!(run_a, run_b);
        assert!(run_a.iter().all(|&t| t < 4));
    }

    #[test]
    fn closure_policy_sees_history() {
        let mut policy = policy_fn("echo-last", |_logits: ArrayView1<'_, f32>, history: &[TokenId]| {
            history.last().copied().unwrap_or(0)
        });
        assert_eq!(policy.name(), "echo-last");
        assert_eq!(policy.select(array![1.0f32].view(), &[4, 8]), 8);
    }
}
