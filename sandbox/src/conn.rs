//! Connection state and the public stream interface.
//!
//! Every ABI version builds its connections as a [`RuntimeConn`]. The
//! state machine is `Created → Active → Closed`, with an absorbing
//! `Faulted` state entered on any unrecovered guest fault. `Faulted`
//! behaves like `Closed` for all operations.
//!
//! [`ConnShared`] is the per-connection state that must be reachable
//! without the core lock: a `close()` racing an in-flight `read()` flips
//! the state and shuts the raw connection down through it, which is what
//! makes the blocked guest call unwind.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use water_hostapi::{Deadlines, RawConn};

use crate::error::{Result, WaterError};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of a runtime connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnState {
    Created = 0,
    Active = 1,
    Closed = 2,
    Faulted = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Active,
            2 => Self::Closed,
            _ => Self::Faulted,
        }
    }

    /// True once no further I/O is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }
}

/// State shared between a connection, its capability shim, and a
/// concurrent `close()`.
pub struct ConnShared {
    state: AtomicU8,
    deadlines: Mutex<Deadlines>,
    /// Second handles to every raw connection the guest opened.
    interrupters: Mutex<Vec<Box<dyn RawConn>>>,
}

impl ConnShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(ConnState::Created as u8),
            deadlines: Mutex::new(Deadlines::default()),
            interrupters: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn ensure_active(&self) -> Result<()> {
        match self.state() {
            ConnState::Active => Ok(()),
            _ => Err(WaterError::UseOfClosedConnection),
        }
    }

    /// `Created → Active`.
    pub fn activate(&self) -> bool {
        self.transition(ConnState::Created, ConnState::Active)
    }

    /// Enter `Faulted` unless already terminal. Returns true on transition.
    pub fn mark_faulted(&self) -> bool {
        self.transition(ConnState::Active, ConnState::Faulted)
            || self.transition(ConnState::Created, ConnState::Faulted)
    }

    /// Enter `Closed` unless already terminal. Returns the previous state.
    pub fn mark_closed(&self) -> ConnState {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if ConnState::from_u8(current).is_terminal() {
                return ConnState::from_u8(current);
            }
            match self.state.compare_exchange(
                current,
                ConnState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return ConnState::from_u8(prev),
                Err(actual) => current = actual,
            }
        }
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn deadlines(&self) -> Deadlines {
        *lock(&self.deadlines)
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        lock(&self.deadlines).read
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        lock(&self.deadlines).write
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        lock(&self.deadlines).read = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        lock(&self.deadlines).write = deadline;
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        lock(&self.deadlines).set_both(deadline);
    }

    /// Keep a handle that can unblock I/O on a raw connection later.
    pub fn add_interrupter(&self, conn: Box<dyn RawConn>) {
        lock(&self.interrupters).push(conn);
    }

    /// Shut down every raw connection the guest opened, unblocking any
    /// read or write in flight. Safe to call repeatedly.
    pub fn interrupt(&self) {
        for conn in lock(&self.interrupters).drain(..) {
            if let Err(e) = conn.shutdown() {
                tracing::trace!(error = %e, "raw connection already shut down");
            }
        }
    }
}

/// A connection whose wire behavior is implemented by a transport module.
///
/// All methods take `&self`; implementations serialize access to their
/// runtime core internally so one connection can be shared across threads.
pub trait RuntimeConn: Send + Sync {
    /// ABI version this connection speaks.
    fn version(&self) -> i32;

    fn state(&self) -> ConnState;

    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write up to `buf.len()` bytes, returning how many were accepted.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Close the connection and release its sandbox. Idempotent.
    fn close(&self) -> Result<()>;

    /// Absolute deadline for both directions. `None` clears it.
    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()>;

    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()>;

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()>;
}

/// Owned handle to a runtime connection.
///
/// Implements [`io::Read`] and [`io::Write`] (also through `&Connection`).
/// Dropping a connection closes it, but callers should close explicitly:
/// drop-time close errors are discarded.
pub struct Connection {
    inner: Box<dyn RuntimeConn>,
}

impl Connection {
    pub fn new(inner: Box<dyn RuntimeConn>) -> Self {
        Self { inner }
    }

    pub fn version(&self) -> i32 {
        self.inner.version()
    }

    pub fn state(&self) -> ConnState {
        self.inner.state()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf)
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.inner.set_deadline(deadline)
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.inner.set_read_deadline(deadline)
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.inner.set_write_deadline(deadline)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

impl io::Read for &Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Connection::read(*self, buf).map_err(io::Error::from)
    }
}

impl io::Write for &Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Connection::write(*self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut &*self, buf)
    }
}

impl io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            tracing::debug!(error = %e, "close on drop failed");
        }
    }
}
