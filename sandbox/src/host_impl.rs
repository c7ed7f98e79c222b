//! Per-instance mutable state held in the Wasmtime Store.
//!
//! `HostState` is the capability shim's view of the world: what the
//! instance is bound to (a managed dialer or a pre-accepted connection),
//! the raw connections it has opened so far, and the shared connection
//! state used for deadlines and cancellation. The guest only ever sees the
//! small integer handles stored here.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use wasmtime::{StoreLimits, StoreLimitsBuilder};

use water_hostapi::{remaining, CapabilityShim, DialError, HostError, ManagedDialer, RawConn};

use crate::config::Config;
use crate::conn::ConnShared;

/// First handle handed to a guest.
pub const FIRST_HANDLE: i32 = 1;

/// Longest a single blocking raw call waits before deadlines are re-read.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// A raw call returned because its slice ran out, not because the
/// connection failed.
fn is_wait_expired(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

/// What `connect()` resolves to for this instance.
pub enum Binding {
    /// Outbound: dial this destination on first connect.
    Outbound(ManagedDialer),
    /// Inbound: hand out this already-accepted connection.
    Inbound(Box<dyn RawConn>),
    /// No capability; `connect()` is not implemented.
    Unbound,
    /// `connect()` already succeeded or failed once.
    Consumed,
}

impl Binding {
    fn describe(&self) -> &'static str {
        match self {
            Self::Outbound(_) => "outbound",
            Self::Inbound(_) => "inbound",
            Self::Unbound => "unbound",
            Self::Consumed => "consumed",
        }
    }
}

/// Per-instance mutable state held in the Wasmtime `Store`.
pub struct HostState {
    binding: Binding,
    conns: HashMap<i32, Box<dyn RawConn>>,
    next_handle: i32,
    shared: Arc<ConnShared>,
    /// Memory growth limits enforced by the store.
    pub(crate) limits: StoreLimits,
    /// Set when a host read or write hit the connection deadline.
    timed_out: bool,
    dial_error: Option<DialError>,
}

impl HostState {
    pub fn new(binding: Binding, shared: Arc<ConnShared>, config: &Config) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .build();
        Self {
            binding,
            conns: HashMap::new(),
            next_handle: FIRST_HANDLE,
            shared,
            limits,
            timed_out: false,
            dial_error: None,
        }
    }

    pub fn outbound(dialer: ManagedDialer, shared: Arc<ConnShared>, config: &Config) -> Self {
        Self::new(Binding::Outbound(dialer), shared, config)
    }

    pub fn inbound(conn: Box<dyn RawConn>, shared: Arc<ConnShared>, config: &Config) -> Self {
        Self::new(Binding::Inbound(conn), shared, config)
    }

    /// Number of raw connections currently open through this instance.
    pub fn open_handles(&self) -> usize {
        self.conns.len()
    }

    /// Forget any timeout observed by a previous call.
    pub fn clear_timeout(&mut self) {
        self.timed_out = false;
    }

    /// Whether a host read or write timed out since the last clear.
    pub fn take_timed_out(&mut self) -> bool {
        mem::take(&mut self.timed_out)
    }

    /// The error behind a failed `connect()`, if any.
    pub fn take_dial_error(&mut self) -> Option<DialError> {
        self.dial_error.take()
    }

    /// Shut down and release every raw connection, including an inbound
    /// connection the guest never claimed.
    ///
    /// Errors from connections the peer already closed are ignored; the
    /// first other error is returned after everything has been released.
    pub fn close_all(&mut self) -> io::Result<()> {
        let mut first_err = None;
        let binding = mem::replace(&mut self.binding, Binding::Consumed);
        let unclaimed = match binding {
            Binding::Inbound(conn) => Some(conn),
            _ => None,
        };
        for conn in self.conns.drain().map(|(_, c)| c).chain(unclaimed) {
            if let Err(e) = conn.shutdown() {
                if e.kind() != io::ErrorKind::NotConnected && first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn register(&mut self, conn: Box<dyn RawConn>) -> i32 {
        match conn.try_clone_conn() {
            Ok(handle) => self.shared.add_interrupter(handle),
            Err(e) => tracing::warn!(error = %e, "raw connection cannot be interrupted on close"),
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.conns.insert(handle, conn);
        handle
    }

    fn conn_mut(&mut self, handle: i32) -> Result<&mut Box<dyn RawConn>, HostError> {
        if self.shared.is_closed() {
            return Err(HostError::closed());
        }
        self.conns.get_mut(&handle).ok_or_else(HostError::invalid_fd)
    }

    /// Time left before `deadline`, flagging the call as timed out once
    /// it has passed.
    fn time_left(&mut self, deadline: Option<Instant>) -> Result<Option<Duration>, HostError> {
        remaining(deadline).map_err(|_| {
            self.timed_out = true;
            HostError::timeout()
        })
    }

    /// How long the next blocking raw call may wait.
    ///
    /// Calls block in slices of at most [`WAIT_SLICE`] so a deadline set
    /// while they are blocked, or a close, is noticed promptly.
    fn next_slice(&mut self, deadline: Option<Instant>) -> Result<Duration, HostError> {
        if self.shared.is_closed() {
            return Err(HostError::closed());
        }
        let left = self.time_left(deadline)?;
        Ok(left.map_or(WAIT_SLICE, |left| left.min(WAIT_SLICE)))
    }

    /// Record a failed raw I/O, translating it for the guest.
    fn io_failure(&mut self, err: io::Error) -> HostError {
        if self.shared.is_closed() {
            return HostError::closed();
        }
        let err = HostError::from(err);
        if err.is_timeout() {
            self.timed_out = true;
        }
        err
    }
}

impl CapabilityShim for HostState {
    fn connect(&mut self) -> Result<i32, HostError> {
        if self.shared.is_closed() {
            return Err(HostError::closed());
        }
        match mem::replace(&mut self.binding, Binding::Consumed) {
            Binding::Outbound(dialer) => {
                tracing::debug!(
                    network = dialer.network(),
                    address = dialer.address(),
                    "guest requested connect"
                );
                match dialer.dial() {
                    Ok(conn) => Ok(self.register(conn)),
                    Err(e) => {
                        tracing::debug!(error = %e, "managed dial failed");
                        self.dial_error = Some(e);
                        Err(HostError::dial_failed())
                    }
                }
            }
            Binding::Inbound(conn) => Ok(self.register(conn)),
            Binding::Unbound => {
                self.binding = Binding::Unbound;
                Err(HostError::not_implemented())
            }
            Binding::Consumed => Err(HostError::double_init()),
        }
    }

    fn host_read(&mut self, handle: i32, buf: &mut [u8]) -> Result<usize, HostError> {
        loop {
            let slice = self.next_slice(self.shared.read_deadline())?;
            let conn = self.conn_mut(handle)?;
            let result = conn.set_read_timeout(Some(slice)).and_then(|()| conn.read(buf));
            match result {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_wait_expired(&e) => continue,
                Err(e) => return Err(self.io_failure(e)),
            }
        }
    }

    fn host_write(&mut self, handle: i32, buf: &[u8]) -> Result<usize, HostError> {
        let mut written = 0;
        while written < buf.len() {
            let slice = self.next_slice(self.shared.write_deadline())?;
            let conn = self.conn_mut(handle)?;
            let result = conn
                .set_write_timeout(Some(slice))
                .and_then(|()| conn.write(&buf[written..]));
            match result {
                Ok(0) => {
                    let e = io::Error::new(io::ErrorKind::WriteZero, "raw write accepted nothing");
                    return Err(self.io_failure(e));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_wait_expired(&e) => continue,
                Err(e) => return Err(self.io_failure(e)),
            }
        }
        let conn = self.conn_mut(handle)?;
        match conn.flush() {
            Ok(()) => Ok(buf.len()),
            Err(e) => Err(self.io_failure(e)),
        }
    }

    fn host_close(&mut self, handle: i32) -> Result<(), HostError> {
        match self.conns.remove(&handle) {
            Some(conn) => match conn.shutdown() {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(HostError::Io(e)),
                _ => Ok(()),
            },
            // Closing twice is fine; closing a handle never issued is not.
            None if (FIRST_HANDLE..self.next_handle).contains(&handle) => Ok(()),
            None => Err(HostError::invalid_fd()),
        }
    }
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("binding", &self.binding.describe())
            .field("open_handles", &self.conns.len())
            .field("next_handle", &self.next_handle)
            .finish_non_exhaustive()
    }
}
