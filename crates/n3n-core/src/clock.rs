//! Monotone, jittered 64-bit replay-protection stamp.
//!
//! Layout, high to low bits: 32 bits whole seconds since the Unix epoch, then
//! either 20 bits microseconds + 8 bits counter ("sub-second" mode), or (once
//! the `co` flag latches) 28 bits of pure counter ("counter-only" mode), and
//! finally a 4-bit flag nibble whose bit 0 is `co`. The `co` latch is
//! permanent: once a process has emitted more than 256 stamps within the same
//! second it stays in counter-only mode for its remaining lifetime.

use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stamps within this many raw units of "now" are accepted. One unit of
/// seconds-space is `1 << 32`; this allows roughly 16s of clock skew in
/// either direction.
pub const TIME_STAMP_FRAME: u64 = 16 * (1u64 << 32);

/// Extra slack added to the "must be increasing" check when the caller
/// tolerates reordering jitter. Widened 256x when the stamp is in
/// counter-only mode (shifted left by `8 * co`).
pub const TIME_STAMP_JITTER: u64 = 1u64 << 7;

const CO_MASK: u64 = 0x1;
const HIGH_MASK_SUBSECOND: u64 = !0xFFFu64; // bits 12..63 (seconds + microseconds)
const HIGH_MASK_COUNTERONLY: u64 = !0xFFFF_FFFFu64; // bits 32..63 (seconds only)

// Sub-second mode: 8-bit counter in bits 4..11.
const COUNTER_MASK_SUBSECOND: u64 = 0xFF0;
const COUNTER_SPACE_SUBSECOND: u64 = 0x100; // 256 distinct values

// Counter-only mode: 28-bit counter in bits 4..31 (absorbs the old
// microsecond field once latched).
const COUNTER_MASK_COUNTERONLY: u64 = 0xFFFF_FFF0;
const COUNTER_SPACE_COUNTERONLY: u64 = 0x1000_0000; // 2^28 distinct values

/// Abstracts the wall-clock source so tests can inject deterministic time.
pub trait WallClock: Send + Sync {
    /// Returns (seconds since epoch, microseconds within that second).
    fn now(&self) -> (u64, u32);
}

#[derive(Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now(&self) -> (u64, u32) {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (d.as_secs(), d.subsec_micros())
    }
}

fn co_of(stamp: u64) -> u64 {
    stamp & CO_MASK
}

fn high_mask_for(co: u64) -> u64 {
    if co == 0 {
        HIGH_MASK_SUBSECOND
    } else {
        HIGH_MASK_COUNTERONLY
    }
}

/// Holds the per-process `time_stamp()` sequence. Production code uses the
/// module-level free functions, which share one process-wide `Clock`; tests
/// that need a deterministic `WallClock` construct their own.
pub struct Clock<C: WallClock = SystemWallClock> {
    source: C,
    prev: Mutex<u64>,
}

impl<C: WallClock> Clock<C> {
    pub fn new(source: C) -> Self {
        Self {
            source,
            prev: Mutex::new(0),
        }
    }

    /// Issues the next stamp. Strictly greater than every stamp previously
    /// issued by this `Clock`.
    pub fn time_stamp(&self) -> u64 {
        let (sec, usec) = self.source.now();
        let now = (sec << 32) | ((usec as u64) << 12);

        let mut prev = self.prev.lock().unwrap();
        let prev_co = co_of(*prev);
        let high_mask = high_mask_for(prev_co);
        let (counter_mask, counter_space) = if prev_co == 0 {
            (COUNTER_MASK_SUBSECOND, COUNTER_SPACE_SUBSECOND)
        } else {
            (COUNTER_MASK_COUNTERONLY, COUNTER_SPACE_COUNTERONLY)
        };

        let same_bucket = (*prev & high_mask) == (now & high_mask);
        let mut counter = if same_bucket {
            ((*prev & counter_mask) >> 4) + 1
        } else {
            0
        };

        let mut co = prev_co;
        if same_bucket && counter >= counter_space {
            // Counter overflowed its space without the high-mask bucket
            // changing: latch into counter-only mode. The count continues in
            // the wider counter-only space rather than resetting, so the
            // stamp still compares strictly greater than `prev`.
            co = 1;
            counter = counter.min(COUNTER_SPACE_COUNTERONLY - 1);
        }

        let stamp = (now & high_mask_for(co)) | (counter << 4) | co;
        *prev = stamp;
        stamp
    }

    /// Failure classes for `verify_and_update`.
    pub fn verify_and_update(
        &self,
        stamp: u64,
        prev_slot: Option<&mut u64>,
        allow_jitter: bool,
    ) -> Result<(), ReplayError> {
        let now = self.time_stamp();
        let frame_diff = (stamp as i128) - (now as i128);
        if frame_diff.unsigned_abs() >= TIME_STAMP_FRAME as u128 {
            return Err(ReplayError::OutOfFrame);
        }

        if let Some(slot) = prev_slot {
            let mut diff = (stamp as i128) - (*slot as i128);
            if allow_jitter {
                diff += (TIME_STAMP_JITTER << (8 * co_of(stamp))) as i128;
            }
            if diff <= 0 {
                return Err(ReplayError::NotStrictlyIncreasing);
            }
            *slot = (*slot).max(stamp);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("stamp outside the acceptance frame")]
    OutOfFrame,
    #[error("stamp is not strictly increasing")]
    NotStrictlyIncreasing,
}

static GLOBAL_CLOCK: OnceLock<Clock<SystemWallClock>> = OnceLock::new();

fn global() -> &'static Clock<SystemWallClock> {
    GLOBAL_CLOCK.get_or_init(|| Clock::new(SystemWallClock))
}

/// Process-wide stamp sequence. See the module docs for the bit layout.
pub fn time_stamp() -> u64 {
    global().time_stamp()
}

/// Convenience wrapper returning `bool` (`true` = accepted) instead of the
/// richer `Result`, matching the spec's `verify_and_update(...) -> bool`
/// surface; prefer `Clock::verify_and_update` when the failure class matters.
pub fn verify_and_update(stamp: u64, prev_slot: Option<&mut u64>, allow_jitter: bool) -> bool {
    global()
        .verify_and_update(stamp, prev_slot, allow_jitter)
        .is_ok()
}
