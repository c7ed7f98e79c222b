//! Capability shim trait: the host-side mirror of the guest's import ABI.
//!
//! Each method corresponds to one function the transport module imports.
//! The sandbox translates guest pointers into slices before calling in, so
//! this trait works with Rust slices rather than raw offsets, and every
//! failure is a `HostError` the linker turns into a negative `i32`.

use crate::error::HostError;

/// The complete set of host operations a transport module may perform.
///
/// Implementations must never block the whole process: a blocking read or
/// write only blocks the guest call that issued it, and must honor the
/// connection's current deadline.
pub trait CapabilityShim {
    /// Obtain the handle of the connection this instance is bound to.
    ///
    /// For outbound connections this dials the managed dialer; for inbound
    /// connections it hands out the pre-accepted connection. Succeeds at
    /// most once per instance.
    fn connect(&mut self) -> Result<i32, HostError>;

    /// Read from the raw connection behind `handle` into `buf`.
    ///
    /// Returns `Ok(0)` at end of stream.
    fn host_read(&mut self, handle: i32, buf: &mut [u8]) -> Result<usize, HostError>;

    /// Write all of `buf` to the raw connection behind `handle`.
    fn host_write(&mut self, handle: i32, buf: &[u8]) -> Result<usize, HostError>;

    /// Close the raw connection behind `handle`. Closing an already closed
    /// handle succeeds.
    fn host_close(&mut self, handle: i32) -> Result<(), HostError>;
}
