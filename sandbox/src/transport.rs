//! Public entry points: dial out or accept in through a transport module.
//!
//! `Dialer` and `Listener` compile their module once and share the compiled
//! code across every connection they create. Each connection still gets its
//! own instance, memory, and store. The ABI version is looked up before
//! anything is compiled, so an unsupported module never runs.

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;

use wasmtime::{Engine, Module};

use water_hostapi::{default_dial_fn, DialFn, ManagedDialer, RawConn};

use crate::config::{Config, TransportModule};
use crate::conn::Connection;
use crate::error::Result;
use crate::registry;
use crate::runtime::{compile, create_engine, RuntimeCore};

/// A transport module compiled for one engine.
struct Compiled {
    module: TransportModule,
    config: Config,
    engine: Engine,
    code: Module,
}

impl Compiled {
    fn new(module: TransportModule, config: Config) -> Result<Self> {
        let engine = create_engine(&config)?;
        let code = compile(&engine, module.bytes())?;
        tracing::debug!(
            module = %module.short_id(),
            version = module.version(),
            "transport module compiled"
        );
        Ok(Self {
            module,
            config,
            engine,
            code,
        })
    }

    /// A fresh, not yet instantiated core.
    fn core(&self) -> RuntimeCore {
        RuntimeCore::new(self.engine.clone(), self.code.clone(), self.config.clone())
    }

    fn version(&self) -> i32 {
        self.module.version()
    }
}

/// Dials outbound connections through a transport module.
pub struct Dialer {
    compiled: Compiled,
    dial_fn: DialFn,
}

impl Dialer {
    /// Fails with `UnknownVersion` before compiling if no outbound
    /// constructor exists for the module's version.
    pub fn new(module: TransportModule, config: Config) -> Result<Self> {
        registry::outbound_ctor(module.version())?;
        Ok(Self {
            compiled: Compiled::new(module, config)?,
            dial_fn: default_dial_fn(),
        })
    }

    /// Replace the function used to open the underlying raw connection.
    pub fn with_dial_fn(mut self, dial_fn: DialFn) -> Self {
        self.dial_fn = dial_fn;
        self
    }

    pub fn module(&self) -> &TransportModule {
        &self.compiled.module
    }

    /// Open a connection whose guest may reach `(network, address)` and
    /// nothing else.
    pub fn dial(&self, network: &str, address: &str) -> Result<Connection> {
        tracing::debug!(
            module = %self.compiled.module.short_id(),
            network,
            address,
            "dial"
        );
        let dialer = ManagedDialer::new(network, address, Arc::clone(&self.dial_fn));
        let conn = registry::construct_outbound(self.compiled.core(), self.compiled.version(), dialer)?;
        Ok(Connection::new(conn))
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("module", &self.compiled.module)
            .field("config", &self.compiled.config)
            .finish_non_exhaustive()
    }
}

/// Accepts inbound TCP connections and wraps each in a transport module.
pub struct Listener {
    compiled: Compiled,
    listener: TcpListener,
}

impl Listener {
    /// Fails with `UnknownVersion` before compiling or binding if no
    /// inbound constructor exists for the module's version.
    pub fn bind(module: TransportModule, config: Config, address: impl ToSocketAddrs) -> Result<Self> {
        registry::inbound_ctor(module.version())?;
        let compiled = Compiled::new(module, config)?;
        let listener = TcpListener::bind(address)?;
        Ok(Self { compiled, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn module(&self) -> &TransportModule {
        &self.compiled.module
    }

    /// Block until a peer connects, then run the module's init against it.
    pub fn accept(&self) -> Result<Connection> {
        let (stream, peer) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        tracing::debug!(%peer, module = %self.compiled.module.short_id(), "accepted");
        self.serve(Box::new(stream))
    }

    /// Wrap an already accepted raw connection.
    pub fn serve(&self, raw: Box<dyn RawConn>) -> Result<Connection> {
        let conn = registry::construct_inbound(self.compiled.core(), self.compiled.version(), raw)?;
        Ok(Connection::new(conn))
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("module", &self.compiled.module)
            .field("local_addr", &self.listener.local_addr().ok())
            .finish_non_exhaustive()
    }
}

/// Dial `(network, address)` through a module of `version`, with the
/// default configuration.
pub fn dial(version: i32, network: &str, address: &str, module_bytes: &[u8]) -> Result<Connection> {
    let module = TransportModule::new(module_bytes, version);
    Dialer::new(module, Config::default())?.dial(network, address)
}

/// Wrap `raw` in a module of `version`, with the default configuration.
pub fn accept_inbound(version: i32, raw: Box<dyn RawConn>, module_bytes: &[u8]) -> Result<Connection> {
    registry::inbound_ctor(version)?;
    let compiled = Compiled::new(TransportModule::new(module_bytes, version), Config::default())?;
    let conn = registry::construct_inbound(compiled.core(), version, raw)?;
    Ok(Connection::new(conn))
}
