//! Version registry: ABI version → connection constructors.
//!
//! The process-wide table is populated once, on first use, by every
//! supported version's `register` function. Entries are write-once:
//! registering a version twice panics, since two implementations of the
//! same ABI generation cannot be told apart safely. Lookups take a read
//! lock and never run a constructor while holding it.

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock, RwLockReadGuard};

use water_hostapi::{ManagedDialer, RawConn};

use crate::conn::RuntimeConn;
use crate::error::{Result, WaterError};
use crate::runtime::RuntimeCore;
use crate::v0;

/// Builds a host-initiated connection: the guest dials through `ManagedDialer`.
pub type OutboundCtor = fn(RuntimeCore, ManagedDialer) -> Result<Box<dyn RuntimeConn>>;

/// Builds a peer-initiated connection over an already accepted raw connection.
pub type InboundCtor = fn(RuntimeCore, Box<dyn RawConn>) -> Result<Box<dyn RuntimeConn>>;

/// A version was registered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("water: version {version} already registered ({direction})")]
pub struct DuplicateVersion {
    pub version: i32,
    pub direction: &'static str,
}

/// Constructor table for every known ABI version.
#[derive(Default)]
pub struct VersionRegistry {
    outbound: HashMap<i32, OutboundCtor>,
    inbound: HashMap<i32, InboundCtor>,
}

impl VersionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_outbound(
        &mut self,
        version: i32,
        ctor: OutboundCtor,
    ) -> std::result::Result<(), DuplicateVersion> {
        if self.outbound.contains_key(&version) {
            return Err(DuplicateVersion {
                version,
                direction: "outbound",
            });
        }
        self.outbound.insert(version, ctor);
        Ok(())
    }

    pub fn insert_inbound(
        &mut self,
        version: i32,
        ctor: InboundCtor,
    ) -> std::result::Result<(), DuplicateVersion> {
        if self.inbound.contains_key(&version) {
            return Err(DuplicateVersion {
                version,
                direction: "inbound",
            });
        }
        self.inbound.insert(version, ctor);
        Ok(())
    }

    /// # Panics
    /// If `version` already has an outbound constructor.
    pub fn register_outbound(&mut self, version: i32, ctor: OutboundCtor) {
        if let Err(e) = self.insert_outbound(version, ctor) {
            panic!("{e}");
        }
    }

    /// # Panics
    /// If `version` already has an inbound constructor.
    pub fn register_inbound(&mut self, version: i32, ctor: InboundCtor) {
        if let Err(e) = self.insert_inbound(version, ctor) {
            panic!("{e}");
        }
    }

    pub fn outbound(&self, version: i32) -> Result<OutboundCtor> {
        self.outbound
            .get(&version)
            .copied()
            .ok_or(WaterError::UnknownVersion(version))
    }

    pub fn inbound(&self, version: i32) -> Result<InboundCtor> {
        self.inbound
            .get(&version)
            .copied()
            .ok_or(WaterError::UnknownVersion(version))
    }

    /// Versions with an outbound constructor, ascending.
    pub fn versions(&self) -> Vec<i32> {
        let mut versions: Vec<i32> = self.outbound.keys().copied().collect();
        versions.sort_unstable();
        versions
    }
}

static REGISTRY: OnceLock<RwLock<VersionRegistry>> = OnceLock::new();

fn global() -> &'static RwLock<VersionRegistry> {
    REGISTRY.get_or_init(|| {
        let mut registry = VersionRegistry::new();
        v0::register(&mut registry);
        RwLock::new(registry)
    })
}

fn read() -> RwLockReadGuard<'static, VersionRegistry> {
    global().read().unwrap_or_else(PoisonError::into_inner)
}

/// Register an outbound constructor process-wide.
///
/// # Panics
/// If `version` is already registered. The panic is raised after the
/// registry lock is released, so later lookups are unaffected.
pub fn register_outbound(version: i32, ctor: OutboundCtor) {
    let inserted = global()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert_outbound(version, ctor);
    if let Err(e) = inserted {
        panic!("{e}");
    }
}

/// Register an inbound constructor process-wide.
///
/// # Panics
/// If `version` is already registered.
pub fn register_inbound(version: i32, ctor: InboundCtor) {
    let inserted = global()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert_inbound(version, ctor);
    if let Err(e) = inserted {
        panic!("{e}");
    }
}

pub fn outbound_ctor(version: i32) -> Result<OutboundCtor> {
    read().outbound(version)
}

pub fn inbound_ctor(version: i32) -> Result<InboundCtor> {
    read().inbound(version)
}

/// Versions registered in this process.
pub fn registered_versions() -> Vec<i32> {
    read().versions()
}

/// Build an outbound connection of `version` on top of `core`.
pub fn construct_outbound(
    core: RuntimeCore,
    version: i32,
    dialer: ManagedDialer,
) -> Result<Box<dyn RuntimeConn>> {
    let ctor = outbound_ctor(version)?;
    ctor(core, dialer)
}

/// Build an inbound connection of `version` on top of `core`, handing
/// `raw` to the guest.
pub fn construct_inbound(
    core: RuntimeCore,
    version: i32,
    raw: Box<dyn RawConn>,
) -> Result<Box<dyn RuntimeConn>> {
    let ctor = inbound_ctor(version)?;
    ctor(core, raw)
}
