//! Token sampling
//!
//! Temperature scaling, nucleus (top-p) filtering, repetition penalty, and
//! no-repeat n-gram suppression over a probability vector indexed by token
//! id. Filters zero out excluded entries and renormalize the remainder.

use crate::backend::TokenId;
use rand::rngs::StdRng;
use rand::Rng;

/// Softmax over logits with temperature scaling.
///
/// Subtracts the max logit before exponentiation for numeric stability.
pub(crate) fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    let temperature = temperature.max(1e-4);
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits
        .iter()
        .map(|&l| ((l - max) / temperature).exp())
        .collect();
    renormalize(&mut probs);
    probs
}

/// Nucleus filter: keep the minimal descending-probability prefix whose
/// cumulative mass reaches `top_p`, zero the rest, renormalize.
///
/// `top_p >= 1.0` keeps every candidate; as `top_p` approaches zero only the
/// single most probable token survives.
pub(crate) fn nucleus_filter(probs: &mut [f32], top_p: f32) {
    if top_p >= 1.0 || probs.is_empty() {
        return;
    }

    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumulative = 0.0f32;
    let mut kept = 0usize;
    for &idx in &order {
        cumulative += probs[idx];
        kept += 1;
        if cumulative >= top_p {
            break;
        }
    }

    for &idx in &order[kept..] {
        probs[idx] = 0.0;
    }
    renormalize(probs);
}

/// Divide the probability of every already-generated token by `penalty`
pub(crate) fn apply_repetition_penalty(probs: &mut [f32], generated: &[TokenId], penalty: f32) {
    if penalty <= 1.0 || generated.is_empty() {
        return;
    }
    let mut touched = false;
    for &token in generated {
        if let Some(p) = probs.get_mut(token as usize) {
            if *p > 0.0 {
                *p /= penalty;
                touched = true;
            }
        }
    }
    if touched {
        renormalize(probs);
    }
}

/// Zero every candidate that would complete an n-gram already present in
/// `generated`. No-op for `n == 0` or when banning would empty the
/// distribution.
pub(crate) fn ban_repeat_ngrams(probs: &mut [f32], generated: &[TokenId], n: usize) {
    if n == 0 || generated.len() < n {
        return;
    }

    let suffix = &generated[generated.len() - (n - 1)..];
    let mut banned: Vec<TokenId> = Vec::new();
    for window in generated.windows(n) {
        if &window[..n - 1] == suffix {
            banned.push(window[n - 1]);
        }
    }
    if banned.is_empty() {
        return;
    }

    let saved = probs.to_vec();
    for &token in &banned {
        if let Some(p) = probs.get_mut(token as usize) {
            *p = 0.0;
        }
    }
    if !renormalize(probs) {
        // Every candidate was banned; suppressing here would deadlock the
        // loop, so leave the distribution untouched.
        probs.copy_from_slice(&saved);
    }
}

/// Sample a token id from the distribution. Falls back to argmax if the
/// cumulative scan runs past the end on rounding error.
pub(crate) fn sample(probs: &[f32], rng: &mut StdRng) -> TokenId {
    let point: f32 = rng.gen();
    let mut cumulative = 0.0f32;
    for (idx, &p) in probs.iter().enumerate() {
        cumulative += p;
        if point < cumulative {
            return idx as TokenId;
        }
    }
    argmax(probs)
}

fn argmax(probs: &[f32]) -> TokenId {
    probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx as TokenId)
        .unwrap_or(0)
}

/// Scale so the vector sums to 1. Returns false (leaving zeros) if the mass
/// is not positive.
fn renormalize(probs: &mut [f32]) -> bool {
    let sum: f32 = probs.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return false;
    }
    for p in probs.iter_mut() {
        *p /= sum;
    }
    true
}
