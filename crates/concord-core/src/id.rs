//! Identifier generation.
//!
//! Identifiers are integers in `1..=2^53` so they survive a round trip
//! through a JSON number.

use std::sync::atomic::{AtomicU64, Ordering};

use concord_protocol::{Id, MAX_ID};

/// Publication ids are unique across the whole process.
static PUBLICATIONS: IdGenerator = IdGenerator::new();

/// Generate a new publication id.
#[must_use]
pub fn next_publication_id() -> Id {
    PUBLICATIONS.next()
}

/// Sequential id generator wrapping at [`MAX_ID`].
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Generate the next id.
    pub fn next(&self) -> Id {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        (raw - 1) % MAX_ID + 1
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
