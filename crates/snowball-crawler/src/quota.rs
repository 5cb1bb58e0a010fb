//! Pure decisions about how much to keep and when to stop.

use std::collections::HashSet;

use crate::backend::{Post, ProfileRecord};

pub const BYTES_PER_GB: f64 = 1_073_741_824.0;

/// Keeps the first `cap` ids in discovery order, or all of them without a cap.
/// Truncates, never samples.
pub fn cap_edges<T: Clone>(ids: &[T], cap: Option<usize>) -> Vec<T> {
    match cap {
        Some(cap) => ids.iter().take(cap).cloned().collect(),
        None => ids.to_vec(),
    }
}

pub fn should_stop(collected_bytes: u64, limit_gb: Option<f64>) -> bool {
    match limit_gb {
        Some(limit) => to_gb(collected_bytes) > limit,
        None => false,
    }
}

pub fn should_continue_hops(hop: u32, max_hops: u32) -> bool {
    hop < max_hops
}

pub fn to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Distinct mentioned accounts, in timeline order.
pub fn mentions(posts: &[Post], cap: Option<usize>) -> Vec<u64> {
    distinct(posts.iter().flat_map(|p| p.mentions.iter().copied()), cap)
}

/// Distinct accounts replied to, in timeline order.
pub fn replies(posts: &[Post], cap: Option<usize>) -> Vec<u64> {
    distinct(posts.iter().filter_map(|p| p.in_reply_to), cap)
}

fn distinct(ids: impl Iterator<Item = u64>, cap: Option<usize>) -> Vec<u64> {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    for id in ids {
        if cap.map_or(false, |cap| kept.len() >= cap) {
            break;
        }
        if seen.insert(id) {
            kept.push(id);
        }
    }
    kept
}

/// Accounts with too many connections are collected but never expanded.
pub fn within_degree(profile: &ProfileRecord, max_degree: Option<u64>) -> bool {
    max_degree.map_or(true, |max| profile.degree() <= max)
}
