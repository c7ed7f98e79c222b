//! Version 0 of the host/guest ABI.
//!
//! A v0 guest imports `connect`, `host_read`, `host_write` and `host_close`
//! from `water_host`, and exports `_water_init`, `_water_read`,
//! `_water_write` and `_water_close`. `_water_init` is expected to call
//! `connect()` exactly once; the read/write exports move bytes between the
//! host scratch region and the raw connection, applying the module's wire
//! transformation on the way.

use std::sync::{Arc, Mutex, TryLockError};
use std::time::Instant;

use water_hostapi::{remaining, ErrorCode, ManagedDialer, RawConn};

use crate::abi::Abi;
use crate::conn::{lock, ConnShared, ConnState, RuntimeConn};
use crate::error::{Fault, Result, WaterError};
use crate::host_impl::HostState;
use crate::registry::VersionRegistry;
use crate::runtime::RuntimeCore;

pub const VERSION: i32 = 0;

pub const ABI: Abi = Abi {
    version: VERSION,
    import_module: "water_host",
    connect: "connect",
    host_read: "host_read",
    host_write: "host_write",
    host_close: "host_close",
    init: "_water_init",
    read: "_water_read",
    write: "_water_write",
    close: "_water_close",
};

/// Add the v0 constructors to `registry`.
pub fn register(registry: &mut VersionRegistry) {
    registry.register_outbound(VERSION, new_outbound);
    registry.register_inbound(VERSION, new_inbound);
}

fn new_outbound(core: RuntimeCore, dialer: ManagedDialer) -> Result<Box<dyn RuntimeConn>> {
    let shared = ConnShared::new();
    let host = HostState::outbound(dialer, Arc::clone(&shared), core.config());
    Ok(Box::new(Conn::start(core, host, shared)?))
}

fn new_inbound(core: RuntimeCore, raw: Box<dyn RawConn>) -> Result<Box<dyn RuntimeConn>> {
    let shared = ConnShared::new();
    let host = HostState::inbound(raw, Arc::clone(&shared), core.config());
    Ok(Box::new(Conn::start(core, host, shared)?))
}

/// Invoke a transfer export and classify its result.
fn call(core: &mut RuntimeCore, export: &str, off: i32, len: i32) -> Result<i32> {
    if let Some(host) = core.host_state_mut() {
        host.clear_timeout();
    }
    let n = core.invoke(export, &[off, len])?;
    let timed_out = core.host_state_mut().is_some_and(HostState::take_timed_out);
    // A guest that swallows ERR_TIMEOUT and reports nothing transferred
    // still timed out.
    if n > 0 || (n == 0 && !timed_out) {
        return Ok(n);
    }
    if timed_out || n == ErrorCode::Timeout.as_i32() {
        return Err(WaterError::Timeout);
    }
    Err(Fault::status(export, n).into())
}

/// A v0 runtime connection.
pub struct Conn {
    /// Serializes every guest call on this connection.
    core: Mutex<RuntimeCore>,
    shared: Arc<ConnShared>,
}

impl Conn {
    /// Instantiate the module and run `_water_init`.
    fn start(mut core: RuntimeCore, host: HostState, shared: Arc<ConnShared>) -> Result<Self> {
        core.instantiate(&ABI, host)?;

        let fault = match core.invoke(ABI.init, &[]) {
            Ok(status) if status >= 0 => None,
            Ok(status) => Some(Fault::status(ABI.init, status)),
            Err(fault) => Some(fault),
        };
        if let Some(fault) = fault {
            let dial_err = core.host_state_mut().and_then(HostState::take_dial_error);
            shared.mark_faulted();
            shared.interrupt();
            if let Err(e) = core.teardown() {
                tracing::debug!(error = %e, "teardown after failed init");
            }
            return Err(match dial_err {
                Some(e) => WaterError::Dial(e),
                None => WaterError::GuestFault(fault),
            });
        }

        shared.activate();
        tracing::debug!(version = VERSION, "connection active");
        Ok(Self {
            core: Mutex::new(core),
            shared,
        })
    }

    /// Run `op` against the core with the connection lock held.
    ///
    /// A guest fault leaves the connection `Faulted` and releases the
    /// instance. A `close()` that raced `op` wins.
    fn with_core<T>(&self, op: impl FnOnce(&mut RuntimeCore) -> Result<T>) -> Result<T> {
        self.shared.ensure_active()?;
        let mut core = lock(&self.core);
        self.shared.ensure_active()?;

        let result = op(&mut core);
        if self.shared.state() == ConnState::Closed {
            return Err(WaterError::UseOfClosedConnection);
        }
        if let Err(WaterError::GuestFault(fault)) = &result {
            self.fault(&mut core, fault);
        }
        result
    }

    fn fault(&self, core: &mut RuntimeCore, fault: &Fault) {
        if self.shared.mark_faulted() {
            tracing::warn!(version = VERSION, fault = %fault, "guest fault, connection unusable");
        }
        self.shared.interrupt();
        if let Err(e) = core.teardown() {
            tracing::warn!(error = %e, "teardown after guest fault failed");
        }
    }

    fn deadline_passed(deadline: Option<Instant>) -> bool {
        remaining(deadline).is_err()
    }
}

impl RuntimeConn for Conn {
    fn version(&self) -> i32 {
        VERSION
    }

    fn state(&self) -> ConnState {
        self.shared.state()
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_core(|core| {
            if buf.is_empty() {
                return Ok(0);
            }
            if Self::deadline_passed(self.shared.read_deadline()) {
                return Err(WaterError::Timeout);
            }
            let scratch = core.scratch().ok_or(WaterError::UseOfClosedConnection)?;
            let (off, len) = scratch.window(buf.len());

            let n = call(core, ABI.read, off, len)?;
            if n > len {
                return Err(Fault::memory(format!(
                    "{} reported {n} bytes for a {len}-byte window",
                    ABI.read
                ))
                .into());
            }
            let n = n as usize;
            let bytes = core.read_memory(scratch.base, n)?;
            buf[..n].copy_from_slice(&bytes);
            tracing::trace!(n, "read");
            Ok(n)
        })
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        self.with_core(|core| {
            if buf.is_empty() {
                return Ok(0);
            }
            if Self::deadline_passed(self.shared.write_deadline()) {
                return Err(WaterError::Timeout);
            }
            let scratch = core.scratch().ok_or(WaterError::UseOfClosedConnection)?;
            let (off, len) = scratch.window(buf.len());
            core.write_memory(scratch.base, &buf[..len as usize])?;

            let n = call(core, ABI.write, off, len)?;
            if n > len {
                return Err(Fault::memory(format!(
                    "{} reported {n} bytes for a {len}-byte window",
                    ABI.write
                ))
                .into());
            }
            tracing::trace!(n, "write");
            Ok(n as usize)
        })
    }

    fn close(&self) -> Result<()> {
        if self.shared.mark_closed().is_terminal() {
            return Ok(());
        }

        // Unblock an in-flight read or write before waiting on it.
        let mut core = match self.core.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.shared.interrupt();
                lock(&self.core)
            }
        };

        if let Some(scratch) = core.scratch() {
            let (off, len) = scratch.window(0);
            match core.invoke(ABI.close, &[off, len]) {
                Ok(status) if status < 0 => {
                    tracing::warn!(status, "guest close returned an error")
                }
                Ok(_) => {}
                Err(fault) => tracing::warn!(fault = %fault, "guest close faulted"),
            }
        }

        self.shared.interrupt();
        let released = core.teardown();
        tracing::debug!(version = VERSION, "connection closed");
        released
    }

    fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        if self.shared.is_closed() {
            return Err(WaterError::UseOfClosedConnection);
        }
        self.shared.set_deadline(deadline);
        Ok(())
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        if self.shared.is_closed() {
            return Err(WaterError::UseOfClosedConnection);
        }
        self.shared.set_read_deadline(deadline);
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        if self.shared.is_closed() {
            return Err(WaterError::UseOfClosedConnection);
        }
        self.shared.set_write_deadline(deadline);
        Ok(())
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("v0::Conn")
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}
