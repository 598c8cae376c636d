use rand::Rng;
use rand::seq::SliceRandom;

use crate::media::{Candidate, MediaItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickMode {
    Random,
    Sequential,
}

impl PickMode {
    pub fn from_pick_randomly(pick_randomly: bool) -> Self {
        if pick_randomly {
            PickMode::Random
        } else {
            PickMode::Sequential
        }
    }
}

/// Builds the ordered attempt list for one update.
///
/// Rules:
/// - The avoided id is left out whenever the pool has more than one item.
/// - Random mode shuffles and carries no sequential index.
/// - Sequential mode scans circularly from the slot after `last_index`, in scan order.
/// - A single-item pool whose only item is avoided still yields that item.
pub fn select_candidates<R: Rng + ?Sized>(
    pool: &[MediaItem],
    max_attempts: usize,
    mode: PickMode,
    last_index: Option<usize>,
    avoid_id: Option<&str>,
    rng: &mut R,
) -> Vec<Candidate> {
    if pool.is_empty() || max_attempts == 0 {
        return Vec::new();
    }
    match mode {
        PickMode::Random => select_random(pool, max_attempts, avoid_id, rng),
        PickMode::Sequential => select_sequential(pool, max_attempts, last_index, avoid_id),
    }
}

fn select_random<R: Rng + ?Sized>(
    pool: &[MediaItem],
    max_attempts: usize,
    avoid_id: Option<&str>,
    rng: &mut R,
) -> Vec<Candidate> {
    let mut working: Vec<&MediaItem> = pool.iter().collect();
    if let Some(avoid) = avoid_id.filter(|_| pool.len() > 1) {
        let filtered: Vec<&MediaItem> = working
            .iter()
            .copied()
            .filter(|item| item.id != avoid)
            .collect();
        if !filtered.is_empty() {
            working = filtered;
        }
    }
    working.shuffle(rng);
    working
        .into_iter()
        .take(max_attempts)
        .map(|item| Candidate {
            item: item.clone(),
            sequential_index: None,
        })
        .collect()
}

fn select_sequential(
    pool: &[MediaItem],
    max_attempts: usize,
    last_index: Option<usize>,
    avoid_id: Option<&str>,
) -> Vec<Candidate> {
    let len = pool.len();
    let start = last_index.map_or(0, |idx| (idx + 1) % len);
    let avoid = avoid_id.filter(|_| len > 1);

    let mut out = Vec::with_capacity(max_attempts.min(len));
    for step in 0..len {
        let idx = (start + step) % len;
        let item = &pool[idx];
        if avoid == Some(item.id.as_str()) {
            continue;
        }
        out.push(Candidate {
            item: item.clone(),
            sequential_index: Some(idx),
        });
        if out.len() == max_attempts {
            break;
        }
    }

    if out.is_empty() {
        out.push(Candidate {
            item: pool[0].clone(),
            sequential_index: Some(0),
        });
    }
    out
}
