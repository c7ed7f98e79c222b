//! `water-sandbox`: Wasmtime runtime for W.A.T.E.R. transport modules.
//!
//! A transport module is untrusted WebAssembly that implements a wire
//! protocol. This crate hosts one instance of it per connection and
//! presents the result as an ordinary byte stream. It enforces:
//!
//! - **Capability restriction:** the guest reaches the network only through
//!   one pre-authorized (network, address) pair or one accepted connection
//! - **Import whitelisting:** only `water_host` imports, no WASI
//! - **ABI validation:** required exports checked before instantiation
//! - **Memory limits:** bounded linear memory growth
//! - **Fuel metering:** optional per-call instruction budget
//! - **Deterministic teardown:** `close()` releases the instance and every
//!   raw connection before returning
//!
//! The entry points are [`Dialer`], [`Listener`], [`dial`] and
//! [`accept_inbound`]; each yields a [`Connection`].

pub mod error;
pub mod config;
pub mod memory;
pub mod abi;
pub mod validation;
pub mod host_impl;
pub mod linker;
pub mod runtime;
pub mod conn;
pub mod registry;
pub mod v0;
pub mod transport;

pub use error::{Fault, FaultKind, WaterError};
pub use config::{Config, TransportModule};
pub use conn::{ConnState, Connection, RuntimeConn};
pub use registry::{InboundCtor, OutboundCtor, VersionRegistry};
pub use runtime::{live_instances, RuntimeCore};
pub use transport::{accept_inbound, dial, Dialer, Listener};

pub use water_hostapi::{DialFn, ManagedDialer, MemConn, RawConn};
