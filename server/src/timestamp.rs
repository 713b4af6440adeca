//! Timestamp keys.
//!
//! Keys are rendered as `%y_%m_%d-%H:%M:%S` in a fixed UTC offset, e.g.
//! `24_01_01-10:00:00`. Every field is zero-padded to a fixed width and the
//! fields run from most to least significant, so within 2000–2099 the
//! lexicographic order of keys is their chronological order. Replay sorts
//! store keys as plain strings and relies on this.

use chrono::{DateTime, FixedOffset, Utc};

const KEY_FORMAT: &str = "%y_%m_%d-%H:%M:%S";

/// Wall-clock source. Only the ingest side reads it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyFormatter {
    offset: FixedOffset,
}

impl KeyFormatter {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn format(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset).format(KEY_FORMAT).to_string()
    }
}
