//! Duplicate suppression for administrative balance mutations.
//!
//! Admin commands arrive over an unreliable conversational channel and are
//! retried by humans and automation alike. This guard is process-local and
//! best-effort; ledger idempotency keys remain the authoritative defense.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::ActorId;

/// Time source owned by the deduplicator. Swapped for a manual clock in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic expiry tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += chrono::Duration::from_std(by).expect("duration in range");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Width of the coarse time bucket folded into derived ledger keys.
    pub bucket_width: Duration,
    /// How long a first-seen mutation suppresses identical ones.
    pub ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            bucket_width: Duration::from_secs(1),
            ttl: Duration::from_secs(5),
        }
    }
}

/// Identity of one administrative mutation attempt.
///
/// Suppression considers who, to whom, and how much; the bucket quantizes the
/// arrival time and feeds the derived ledger idempotency key so duplicates
/// from another process can still collapse downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutationKey {
    pub actor: ActorId,
    pub target: ActorId,
    pub amount: Decimal,
    pub bucket: i64,
}

type SuppressionId = (ActorId, ActorId, Decimal);

/// TTL-bounded guard: `should_proceed` answers true exactly once per key per
/// TTL window, then true again after expiry. Expired entries are swept lazily
/// on each call, amortized O(1) thanks to the insertion-ordered queue.
#[derive(Debug)]
pub struct OperationDeduplicator {
    config: DedupConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<DedupState>,
}

#[derive(Debug, Default)]
struct DedupState {
    first_seen: HashMap<SuppressionId, DateTime<Utc>>,
    expiry_queue: VecDeque<(DateTime<Utc>, SuppressionId)>,
}

impl Default for OperationDeduplicator {
    fn default() -> Self {
        Self::new(DedupConfig::default(), Arc::new(SystemClock))
    }
}

impl OperationDeduplicator {
    pub fn new(config: DedupConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(DedupState::default()),
        }
    }

    /// Derive the key for an administrative mutation arriving now.
    pub fn key(&self, actor: ActorId, target: ActorId, amount: Decimal) -> MutationKey {
        let width_ms = self.config.bucket_width.as_millis().max(1) as i64;
        MutationKey {
            actor,
            target,
            amount,
            bucket: self.clock.now().timestamp_millis() / width_ms,
        }
    }

    /// True exactly once per (actor, target, amount) per TTL window.
    pub fn should_proceed(&self, key: &MutationKey) -> bool {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.config.ttl).expect("ttl in range");
        let id = (key.actor, key.target, key.amount);

        let mut state = self.state.lock().expect("dedup lock");

        while let Some((seen, queued_id)) = state.expiry_queue.front().cloned() {
            if now - seen < ttl {
                break;
            }
            state.expiry_queue.pop_front();
            // Only evict if this queue entry still describes the live record.
            if state.first_seen.get(&queued_id) == Some(&seen) {
                state.first_seen.remove(&queued_id);
            }
        }

        match state.first_seen.get(&id) {
            Some(seen) if now - *seen < ttl => false,
            _ => {
                state.first_seen.insert(id, now);
                state.expiry_queue.push_back((now, id));
                true
            }
        }
    }

    /// Live (unexpired) entry count. Diagnostic only.
    pub fn len(&self) -> usize {
        self.state.lock().expect("dedup lock").first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn manual() -> (Arc<ManualClock>, OperationDeduplicator) {
        // Whole-second epoch so bucket boundaries are predictable.
        let start = DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp");
        let clock = Arc::new(ManualClock::starting_at(start));
        let dedup = OperationDeduplicator::new(DedupConfig::default(), clock.clone());
        (clock, dedup)
    }

    #[test]
    fn test_true_once_then_false_then_true_after_expiry() {
        let (clock, dedup) = manual();
        let key = dedup.key(ActorId(1), ActorId(2), dec!(1000));

        assert!(dedup.should_proceed(&key));
        assert!(!dedup.should_proceed(&key));

        clock.advance(Duration::from_secs(2));
        let retry = dedup.key(ActorId(1), ActorId(2), dec!(1000));
        assert!(!dedup.should_proceed(&retry), "still inside the TTL window");

        clock.advance(Duration::from_secs(4));
        let late = dedup.key(ActorId(1), ActorId(2), dec!(1000));
        assert!(dedup.should_proceed(&late), "window expired");
    }

    #[test]
    fn test_distinct_mutations_do_not_suppress_each_other() {
        let (_clock, dedup) = manual();

        let a = dedup.key(ActorId(1), ActorId(2), dec!(1000));
        let b = dedup.key(ActorId(1), ActorId(3), dec!(1000));
        let c = dedup.key(ActorId(1), ActorId(2), dec!(500));

        assert!(dedup.should_proceed(&a));
        assert!(dedup.should_proceed(&b));
        assert!(dedup.should_proceed(&c));
    }

    #[test]
    fn test_expired_entries_are_swept() {
        let (clock, dedup) = manual();
        for target in 0..16 {
            let key = dedup.key(ActorId(1), ActorId(target), dec!(10));
            assert!(dedup.should_proceed(&key));
        }
        assert_eq!(dedup.len(), 16);

        clock.advance(Duration::from_secs(6));
        let key = dedup.key(ActorId(1), ActorId(99), dec!(10));
        assert!(dedup.should_proceed(&key));
        assert_eq!(dedup.len(), 1, "expired entries evicted on the next call");
    }

    #[test]
    fn test_bucket_quantizes_time() {
        let (clock, dedup) = manual();
        let first = dedup.key(ActorId(1), ActorId(2), dec!(10));
        clock.advance(Duration::from_millis(200));
        let second = dedup.key(ActorId(1), ActorId(2), dec!(10));
        clock.advance(Duration::from_secs(3));
        let third = dedup.key(ActorId(1), ActorId(2), dec!(10));

        assert_eq!(first.bucket, second.bucket);
        assert_ne!(first.bucket, third.bucket);
    }
}
