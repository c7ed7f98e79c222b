//! Deadline bookkeeping shared by a connection and its capability shim.
//!
//! Deadlines are absolute instants. Raw connections only understand
//! relative timeouts, so every blocking call converts the deadline into the
//! time remaining right before it blocks.

use std::time::{Duration, Instant};

/// Read and write deadlines for one connection. `None` means no deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadlines {
    pub read: Option<Instant>,
    pub write: Option<Instant>,
}

/// The deadline has already passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired;

impl Deadlines {
    /// Set both directions at once.
    pub fn set_both(&mut self, deadline: Option<Instant>) {
        self.read = deadline;
        self.write = deadline;
    }
}

/// Timeout to apply to a raw connection right now for `deadline`.
///
/// Returns `Err(Expired)` once the deadline has passed; a zero timeout is
/// never produced because sockets reject it.
pub fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>, Expired> {
    remaining_at(deadline, Instant::now())
}

fn remaining_at(deadline: Option<Instant>, now: Instant) -> Result<Option<Duration>, Expired> {
    match deadline {
        None => Ok(None),
        Some(d) if d <= now => Err(Expired),
        Some(d) => Ok(Some(d - now)),
    }
}
