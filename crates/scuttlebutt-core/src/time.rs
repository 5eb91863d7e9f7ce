//! Monotonic timestamp generation
//!
//! Every update a replica emits must carry a timestamp strictly greater than
//! the previous one from the same source. Replicas sharing an id (clones)
//! live in the same process, so the generator is process-wide.

use crate::types::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST: AtomicU64 = AtomicU64::new(0);

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Next local timestamp: wall-clock microseconds, bumped past the last
/// issued value when the clock stalls or steps backwards.
pub fn timestamp() -> Timestamp {
    let now = wall_clock_micros();
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return Timestamp(next),
            Err(current) => last = current,
        }
    }
}
