//! Host/guest ABI descriptions.
//!
//! An `Abi` names the import namespace, the capability functions the host
//! supplies, and the exports a conformant transport module must provide
//! for one protocol version. Signatures are fixed across versions: every
//! capability function and every export returns a single `i32`.

/// Export name of the guest's linear memory.
pub const MEMORY_EXPORT: &str = "memory";

/// One generation of the host/guest contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abi {
    pub version: i32,

    /// Module name every guest import must come from.
    pub import_module: &'static str,

    // Capability shim (host → guest imports).
    /// `() -> handle`
    pub connect: &'static str,
    /// `(handle, off, len) -> n`
    pub host_read: &'static str,
    /// `(handle, off, len) -> n`
    pub host_write: &'static str,
    /// `(handle) -> status`
    pub host_close: &'static str,

    // Guest exports.
    /// `() -> status`, called once after instantiation.
    pub init: &'static str,
    /// `(off, len) -> n`
    pub read: &'static str,
    /// `(off, len) -> n`
    pub write: &'static str,
    /// `(off, len) -> status`
    pub close: &'static str,
}

impl Abi {
    /// Capability functions the host defines, with their i32 parameter counts.
    pub fn imports(&self) -> [(&'static str, usize); 4] {
        [
            (self.connect, 0),
            (self.host_read, 3),
            (self.host_write, 3),
            (self.host_close, 1),
        ]
    }

    /// Required function exports: (name, i32 params, i32 results).
    pub fn exports(&self) -> [(&'static str, usize, usize); 4] {
        [
            (self.init, 0, 1),
            (self.read, 2, 1),
            (self.write, 2, 1),
            (self.close, 2, 1),
        ]
    }

    pub fn is_capability(&self, name: &str) -> bool {
        self.imports().iter().any(|(n, _)| *n == name)
    }
}
