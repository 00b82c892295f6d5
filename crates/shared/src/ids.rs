//! Identifier derivation
//!
//! Conversation ids are derived from the two participants so both sides compute the
//! same value independently. Message ids are time-ordered 63-bit integers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Canonical two-party conversation id: smaller id first, joined with `_`
pub fn conversation_id(a: &str, b: &str) -> String {
    if a < b {
        format!("{a}_{b}")
    } else {
        format!("{b}_{a}")
    }
}

/// 2024-01-01T00:00:00Z in milliseconds
const EPOCH_MS: u64 = 1_704_067_200_000;

const NODE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const MAX_NODE: u64 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Snowflake-style message id generator.
///
/// Layout: 41 bits of milliseconds since [`EPOCH_MS`], 10 bits of node id, 12 bits of
/// sequence. Ids from one generator are strictly increasing; ids from generators with
/// distinct node ids never collide. When the sequence for a millisecond is exhausted
/// the generator borrows the next millisecond instead of spinning.
#[derive(Debug)]
pub struct MessageIdGenerator {
    node_id: u64,
    /// Packed `(millis << SEQUENCE_BITS) | sequence` of the last issued id
    state: AtomicU64,
}

impl MessageIdGenerator {
    /// Create a generator. Node ids above 1023 are masked down.
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: u64::from(node_id) & MAX_NODE,
            state: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> i64 {
        loop {
            let now = current_millis();
            let prev = self.state.load(Ordering::Acquire);
            let prev_ms = prev >> SEQUENCE_BITS;

            let (ms, seq) = if now > prev_ms {
                (now, 0)
            } else {
                let seq = (prev & MAX_SEQUENCE) + 1;
                if seq > MAX_SEQUENCE {
                    (prev_ms + 1, 0)
                } else {
                    (prev_ms, seq)
                }
            };

            let next = (ms << SEQUENCE_BITS) | seq;
            if self
                .state
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let id = (ms << (NODE_BITS + SEQUENCE_BITS)) | (self.node_id << SEQUENCE_BITS) | seq;
                return (id & i64::MAX as u64) as i64;
            }
        }
    }
}

fn current_millis() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(EPOCH_MS);
    since_unix.saturating_sub(EPOCH_MS)
}
