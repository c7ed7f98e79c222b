//! The managed dialer capability.
//!
//! A `ManagedDialer` binds exactly one (network, address) pair to one
//! underlying dial function. The guest can only ask the shim to "connect";
//! it never names a destination, so a module cannot turn the host into an
//! open proxy. `dial` consumes the dialer: one dial per module instance.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::error::DialError;
use crate::raw_conn::{dial_stream, RawConn};

/// Underlying dial function: `(network, address) -> raw connection`.
pub type DialFn = Arc<dyn Fn(&str, &str) -> io::Result<Box<dyn RawConn>> + Send + Sync>;

/// The default [`DialFn`], backed by [`dial_stream`].
pub fn default_dial_fn() -> DialFn {
    Arc::new(dial_stream)
}

/// Capability to open one connection to one pre-authorized destination.
pub struct ManagedDialer {
    network: String,
    address: String,
    dial_fn: DialFn,
}

impl ManagedDialer {
    pub fn new(network: impl Into<String>, address: impl Into<String>, dial_fn: DialFn) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
            dial_fn,
        }
    }

    /// Bind to `(network, address)` using the default dial function.
    pub fn with_default(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(network, address, default_dial_fn())
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Dial the bound destination.
    pub fn dial(self) -> Result<Box<dyn RawConn>, DialError> {
        (self.dial_fn)(&self.network, &self.address).map_err(|source| DialError {
            network: self.network,
            address: self.address,
            source,
        })
    }
}

impl fmt::Debug for ManagedDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedDialer")
            .field("network", &self.network)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
