//! Revision ("TID") generation.
//!
//! A revision is a 13-character string over a sortable base32 alphabet
//! encoding `(microseconds since epoch << 10) | clock_id`. String order
//! equals numeric order, and a per-clock high-water mark makes successive
//! revisions strictly increasing even when the wall clock stalls or steps
//! backwards within a process.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

const ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

/// Width of the clock-id tiebreaker in bits.
const CLOCK_ID_BITS: u64 = 10;

#[derive(Debug)]
pub struct TidClock {
    clock_id: u64,
    last: Mutex<u64>,
}

impl TidClock {
    pub fn new(clock_id: u16) -> Self {
        Self {
            clock_id: u64::from(clock_id) & ((1 << CLOCK_ID_BITS) - 1),
            last: Mutex::new(0),
        }
    }

    /// Returns the next revision, strictly greater than all previous
    /// revisions from this clock.
    pub fn next(&self) -> String {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        let mut candidate = (micros << CLOCK_ID_BITS) | self.clock_id;

        let mut last = self.last.lock();
        if candidate <= *last {
            candidate = *last + 1;
        }
        *last = candidate;
        encode(candidate)
    }
}

/// Returns the next revision from the process-wide clock.
pub fn next_tid() -> String {
    static CLOCK: OnceLock<TidClock> = OnceLock::new();
    CLOCK.get_or_init(|| TidClock::new(rand::random::<u16>())).next()
}

fn encode(value: u64) -> String {
    let mut out = String::with_capacity(13);
    for i in 0..13 {
        let shift = 60 - 5 * i;
        out.push(ALPHABET[((value >> shift) & 0x1f) as usize] as char);
    }
    out
}
