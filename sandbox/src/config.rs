//! Runtime configuration and the transport module input.

use std::fmt;
use std::sync::Arc;

/// WebAssembly page size in bytes.
pub const WASM_PAGE_SIZE: usize = 65536;

/// Configuration for the per-connection sandbox.
///
/// Controls memory limits, the host scratch region, and instruction fuel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum linear memory pages (1 page = 64 KiB), scratch included.
    /// Default: 256 pages = 16 MiB.
    pub max_memory_pages: u32,

    /// Pages grown onto guest memory after instantiation for host-owned
    /// transfer buffers. Bounds a single read or write.
    /// Default: 4 pages = 256 KiB.
    pub scratch_pages: u32,

    /// Fuel granted to every guest call. `None` disables metering.
    pub fuel_per_call: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_memory_pages: 256, // 16 MiB
            scratch_pages: 4,
            fuel_per_call: None,
        }
    }
}

impl Config {
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_pages as usize * WASM_PAGE_SIZE
    }

    pub fn scratch_bytes(&self) -> usize {
        self.scratch_pages as usize * WASM_PAGE_SIZE
    }
}

/// A transport module binary and the ABI version it declares.
///
/// Immutable once constructed; cloning shares the bytes.
#[derive(Clone)]
pub struct TransportModule {
    bytes: Arc<[u8]>,
    version: i32,
    fingerprint: blake3::Hash,
}

impl TransportModule {
    pub fn new(bytes: impl Into<Vec<u8>>, version: i32) -> Self {
        let bytes: Arc<[u8]> = bytes.into().into();
        let fingerprint = blake3::hash(&bytes);
        Self {
            bytes,
            version,
            fingerprint,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    /// Content hash of the module bytes, for logs and caching.
    pub fn fingerprint(&self) -> blake3::Hash {
        self.fingerprint
    }

    /// First 16 hex digits of the fingerprint.
    pub fn short_id(&self) -> String {
        self.fingerprint.to_hex()[..16].to_string()
    }
}

impl fmt::Debug for TransportModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportModule")
            .field("version", &self.version)
            .field("len", &self.bytes.len())
            .field("fingerprint", &self.short_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_memory_pages, 256);
        assert_eq!(config.scratch_pages, 4);
        assert_eq!(config.fuel_per_call, None);
        assert_eq!(config.max_memory_bytes(), 16 * 1024 * 1024);
        assert_eq!(config.scratch_bytes(), 256 * 1024);
    }

    #[test]
    fn test_transport_module_fingerprint_is_content_hash() {
        let a = TransportModule::new(b"(module)".to_vec(), 0);
        let b = TransportModule::new(b"(module)".to_vec(), 1);
        let c = TransportModule::new(b"(module )".to_vec(), 0);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.short_id().len(), 16);
        assert_eq!(b.version(), 1);
        assert_eq!(a.bytes(), b"(module)");
    }
}
