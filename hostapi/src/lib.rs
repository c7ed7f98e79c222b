//! `water-hostapi`: capability types shared by the W.A.T.E.R. host and
//! its transport-module sandbox.
//!
//! This crate holds everything about the host/guest contract that does not
//! depend on the execution engine:
//!
//! - `ErrorCode`: negative status codes the guest sees
//! - `HostError` / `DialError`: host-side error types
//! - `RawConn`: the blocking byte stream handed to a guest
//! - `MemConn`: in-memory `RawConn` pair for testing
//! - `ManagedDialer`: one pre-authorized (network, address) capability
//! - `Deadlines`: absolute read/write deadlines
//! - `CapabilityShim`: the host functions a guest may import

pub mod error;
pub mod types;
pub mod raw_conn;
pub mod mem_conn;
pub mod dialer;
pub mod traits;

pub use error::{DialError, ErrorCode, HostError};
pub use types::{remaining, Deadlines, Expired};
pub use raw_conn::{dial_stream, RawConn};
pub use mem_conn::MemConn;
pub use dialer::{default_dial_fn, DialFn, ManagedDialer};
pub use traits::CapabilityShim;
