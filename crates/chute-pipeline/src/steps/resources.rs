//! CPU share allocation across running chutes.
//!
//! Shares are scaled so the node total is close to `1024 * N`. Chutes that
//! reserved a CPU fraction keep it; the unreserved remainder is split evenly
//! among the rest. Reservations summing past the whole node are scaled down.

use std::collections::BTreeMap;

use chute_core::Chute;
use serde::{Deserialize, Serialize};

use super::StepEnv;
use crate::error::Result;
use crate::step::StepOutcome;
use crate::update::{keys, CacheValue, Update};

pub const SHARES_PER_CHUTE: u64 = 1024;
pub const MIN_SHARES: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub cpu_shares: u64,
    /// Sum of the services' memory limits, when every service set one.
    pub memory: Option<u64>,
}

/// Allocation for each chute, keyed by name.
pub fn allocate(chutes: &[&Chute]) -> BTreeMap<String, Allocation> {
    if chutes.is_empty() {
        return BTreeMap::new();
    }
    let total = SHARES_PER_CHUTE * chutes.len() as u64;
    let reserved: f64 = chutes.iter().filter_map(|c| c.cpu_fraction()).sum();
    let unreserved = chutes.iter().filter(|c| c.cpu_fraction().is_none()).count();
    let scale = if reserved > 1.0 { 1.0 / reserved } else { 1.0 };
    let remainder = (1.0 - reserved * scale).max(0.0);

    chutes
        .iter()
        .map(|chute| {
            let fraction = match chute.cpu_fraction() {
                Some(f) => f * scale,
                None => remainder / unreserved as f64,
            };
            let shares = ((fraction * total as f64).round() as u64).max(MIN_SHARES);
            (
                chute.name.clone(),
                Allocation {
                    cpu_shares: shares,
                    memory: memory_limit(chute),
                },
            )
        })
        .collect()
}

fn memory_limit(chute: &Chute) -> Option<u64> {
    chute
        .services
        .values()
        .map(|s| s.requests.memory)
        .sum::<Option<u64>>()
}

pub fn compute(update: &mut Update, env: &StepEnv) -> Result<StepOutcome> {
    let stored = env.store.list();
    let mut running: Vec<&Chute> = stored
        .iter()
        .filter(|c| c.is_running() && c.name != update.name())
        .collect();
    let desired = update.desired().filter(|c| c.is_running()).cloned();
    if let Some(chute) = &desired {
        running.push(chute);
    }

    let allocation = allocate(&running);
    if let Some(mine) = allocation.get(update.name()) {
        tracing::debug!(chute = %update.name(), shares = mine.cpu_shares, chutes = running.len(), "cpu shares");
    }
    update
        .cache
        .set(keys::ALLOCATION, CacheValue::Allocation(allocation));
    Ok(StepOutcome::Done)
}
