//! Next-token selection.
//!
//! The pipeline runs in a fixed order: repetition penalty, temperature, top-k, then nucleus
//! (top-p). Changing the order changes the output distribution.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::model::Token;

/// Temperatures at or below this select the argmax.
pub const TEMP_EPSILON: f32 = 1e-5;

static SHARED_RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::from_entropy()));

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplingError {
    #[error("logits vector is empty")]
    EmptyLogits,
    #[error("no finite logits to sample from")]
    NoFiniteLogits,
    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub top_k: usize,
    pub top_p: f32,
    pub temp: f32,
    pub repeat_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { top_k: 40, top_p: 0.9, temp: 0.1, repeat_penalty: 1.2 }
    }
}

/// The token picked by [`sample`] and the probability it was drawn with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampled {
    pub token: Token,
    pub probability: f32,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: usize,
    logit: f32,
}

// Descending by logit, lowest id first on ties. Adding 0.0 folds -0.0 into 0.0, which
// `total_cmp` would otherwise rank lower.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    (b.logit + 0.0).total_cmp(&(a.logit + 0.0)).then(a.id.cmp(&b.id))
}

/// Reseed the process-wide random source used when the caller supplies none.
pub fn reseed_shared(seed: u64) {
    *SHARED_RNG.lock() = StdRng::seed_from_u64(seed);
}

/// Sample with the process-wide random source.
pub fn sample_shared(
    logits: &[f32],
    recent: &[Token],
    params: &SamplingParams,
) -> Result<Sampled, SamplingError> {
    let mut rng = SHARED_RNG.lock();
    sample(logits, recent, params, &mut *rng)
}

/// Pick the next token from `logits`.
///
/// `recent` is the trailing repetition window; every id in it is penalized once, no matter
/// how often it occurs.
pub fn sample<R: Rng + ?Sized>(
    logits: &[f32],
    recent: &[Token],
    params: &SamplingParams,
    rng: &mut R,
) -> Result<Sampled, SamplingError> {
    if logits.is_empty() {
        return Err(SamplingError::EmptyLogits);
    }

    let mut candidates: Vec<Candidate> = logits
        .iter()
        .enumerate()
        .map(|(id, &logit)| Candidate {
            id,
            logit: if logit.is_nan() { f32::NEG_INFINITY } else { logit },
        })
        .collect();

    apply_repeat_penalty(&mut candidates, recent, params.repeat_penalty);

    if params.temp <= TEMP_EPSILON || params.top_k == 1 {
        return argmax(&candidates);
    }

    for c in candidates.iter_mut() {
        c.logit /= params.temp;
    }

    let k = params.top_k.clamp(1, candidates.len());
    if k < candidates.len() {
        candidates.select_nth_unstable_by(k - 1, rank);
        candidates.truncate(k);
    }
    candidates.sort_by(rank);

    let max = candidates[0].logit;
    if !max.is_finite() {
        return Err(SamplingError::NoFiniteLogits);
    }
    let mut probs: Vec<f32> = candidates.iter().map(|c| (c.logit - max).exp()).collect();
    normalize(&mut probs);

    let mut keep = probs.len();
    let mut cumulative = 0.0;
    for (i, p) in probs.iter().enumerate() {
        cumulative += p;
        if cumulative >= params.top_p {
            keep = i + 1;
            break;
        }
    }
    probs.truncate(keep);
    normalize(&mut probs);

    let dist = WeightedIndex::new(&probs)
        .map_err(|e| SamplingError::InvalidDistribution(e.to_string()))?;
    let picked = dist.sample(rng);
    Ok(Sampled { token: candidates[picked].id as Token, probability: probs[picked] })
}

fn apply_repeat_penalty(candidates: &mut [Candidate], recent: &[Token], penalty: f32) {
    if penalty <= 0.0 || penalty == 1.0 {
        return;
    }
    let mut window: Vec<usize> = recent
        .iter()
        .filter_map(|&t| usize::try_from(t).ok())
        .filter(|&t| t < candidates.len())
        .collect();
    window.sort_unstable();
    window.dedup();
    for id in window {
        let c = &mut candidates[id];
        // dividing a negative logit would raise it
        if c.logit < 0.0 {
            c.logit *= penalty;
        } else {
            c.logit /= penalty;
        }
    }
}

fn argmax(candidates: &[Candidate]) -> Result<Sampled, SamplingError> {
    let best = candidates
        .iter()
        .min_by(|a, b| rank(a, b))
        .ok_or(SamplingError::EmptyLogits)?;
    if best.logit == f32::NEG_INFINITY {
        return Err(SamplingError::NoFiniteLogits);
    }
    Ok(Sampled { token: best.id as Token, probability: 1.0 })
}

fn normalize(probs: &mut [f32]) {
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(top_k: usize, top_p: f32, temp: f32, repeat_penalty: f32) -> SamplingParams {
        SamplingParams { top_k, top_p, temp, repeat_penalty }
    }

    #[test]
    fn zero_temperature_is_argmax() {
        let logits = [0.5, 3.0, 2.9, -1.0];
        let mut rng = StdRng::seed_from_u64(7);
        for top_p in [0.0, 0.5, 1.0] {
            let s = sample(&logits, &[], &params(40, top_p, 0.0, 1.0), &mut rng).unwrap();
            assert_eq!(s.token, 1);
            assert_eq!(s.probability, 1.0);
        }
    }

    #[test]
    fn top_k_one_ignores_top_p_and_penalty() {
        let logits = [1.0, 5.0, 4.0, 3.0];
        let mut rng = StdRng::seed_from_u64(1);
        for (top_p, penalty) in [(0.1, 1.0), (1.0, 1.5), (0.7, 3.0)] {
            let s = sample(&logits, &[2, 3], &params(1, top_p, 0.8, penalty), &mut rng).unwrap();
            assert_eq!(s.token, 1);
        }
    }

    #[test]
    fn ties_break_to_lowest_id() {
        let logits = [2.0, 7.0, 7.0, 7.0];
        let mut rng = StdRng::seed_from_u64(3);
        let s = sample(&logits, &[], &params(40, 0.9, 0.0, 1.0), &mut rng).unwrap();
        assert_eq!(s.token, 1);
    }

    #[test]
    fn signed_zeros_are_ties() {
        let logits = [-0.0, 0.0, -1.0];
        let mut rng = StdRng::seed_from_u64(3);
        let s = sample(&logits, &[], &params(40, 0.9, 0.0, 1.0), &mut rng).unwrap();
        assert_eq!(s.token, 0);

        // the top-k cut keeps the two lowest ids among the zeros
        let logits = [-0.0, -1.0, 0.0, -0.0];
        for _ in 0..200 {
            let s = sample(&logits, &[], &params(2, 1.0, 1.0, 1.0), &mut rng).unwrap();
            assert!(s.token == 0 || s.token == 2, "got {}", s.token);
        }
    }

    #[test]
    fn penalty_halves_recent_logits() {
        let mut candidates: Vec<Candidate> =
            (0..10).map(|id| Candidate { id, logit: 4.0 }).collect();
        candidates[3].logit = -2.0;
        apply_repeat_penalty(&mut candidates, &[5, 7, 7, 3], 2.0);
        assert_eq!(candidates[5].logit, 2.0);
        assert_eq!(candidates[7].logit, 2.0);
        assert_eq!(candidates[3].logit, -4.0);
        assert_eq!(candidates[6].logit, 4.0);
    }

    #[test]
    fn penalty_can_change_the_winner() {
        // 6.0 / 2.0 drops below 5.0
        let logits = [0.0, 6.0, 5.0];
        let mut rng = StdRng::seed_from_u64(0);
        let s = sample(&logits, &[1], &params(40, 1.0, 0.0, 2.0), &mut rng).unwrap();
        assert_eq!(s.token, 2);
    }

    #[test]
    fn penalty_of_one_is_a_no_op() {
        let mut candidates: Vec<Candidate> =
            (0..4).map(|id| Candidate { id, logit: id as f32 }).collect();
        apply_repeat_penalty(&mut candidates, &[0, 1, 2, 3], 1.0);
        for (id, c) in candidates.iter().enumerate() {
            assert_eq!(c.logit, id as f32);
        }
    }

    #[test]
    fn top_k_restricts_candidates() {
        let logits = [1.0, 1.1, 1.2, 9.0, 8.9];
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..200 {
            let s = sample(&logits, &[], &params(2, 1.0, 1.0, 1.0), &mut rng).unwrap();
            assert!(s.token == 3 || s.token == 4, "got {}", s.token);
        }
    }

    #[test]
    fn nucleus_keeps_smallest_prefix() {
        // softmax puts ~0.84 on token 0 and ~0.11 on token 1
        let logits = [4.0, 2.0, 0.0, -1.0];
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            let s = sample(&logits, &[], &params(40, 0.8, 1.0, 1.0), &mut rng).unwrap();
            assert_eq!(s.token, 0);
            assert_eq!(s.probability, 1.0);
        }
        let mut seen = [false; 4];
        for _ in 0..500 {
            let s = sample(&logits, &[], &params(40, 0.9, 1.0, 1.0), &mut rng).unwrap();
            seen[s.token as usize] = true;
        }
        assert_eq!(seen, [true, true, false, false]);
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        let logits: Vec<f32> = (0..32).map(|i| (i % 7) as f32 * 0.3).collect();
        let p = params(10, 0.95, 0.9, 1.1);
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let x = sample(&logits, &[1, 2], &p, &mut a).unwrap();
            let y = sample(&logits, &[1, 2], &p, &mut b).unwrap();
            assert_eq!(x, y);
        }
    }

    #[test]
    fn nan_logits_are_never_picked() {
        let logits = [f32::NAN, 0.5, f32::NAN];
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..50 {
            let s = sample(&logits, &[], &params(3, 1.0, 1.0, 1.0), &mut rng).unwrap();
            assert_eq!(s.token, 1);
        }
    }

    #[test]
    fn degenerate_logits_are_errors() {
        let mut rng = StdRng::seed_from_u64(0);
        let p = params(40, 0.9, 0.7, 1.0);
        assert_eq!(sample(&[], &[], &p, &mut rng), Err(SamplingError::EmptyLogits));
        let dead = [f32::NEG_INFINITY, f32::NAN];
        assert_eq!(sample(&dead, &[], &p, &mut rng), Err(SamplingError::NoFiniteLogits));
        assert_eq!(
            sample(&dead, &[], &params(40, 0.9, 0.0, 1.0), &mut rng),
            Err(SamplingError::NoFiniteLogits)
        );
    }

    #[test]
    fn shared_source_can_be_reseeded() {
        let logits: Vec<f32> = (0..16).map(|i| i as f32 * 0.1).collect();
        let p = params(16, 1.0, 1.0, 1.0);
        reseed_shared(99);
        let first: Vec<Token> =
            (0..20).map(|_| sample_shared(&logits, &[], &p).unwrap().token).collect();
        reseed_shared(99);
        let second: Vec<Token> =
            (0..20).map(|_| sample_shared(&logits, &[], &p).unwrap().token).collect();
        assert_eq!(first, second);
    }
}
