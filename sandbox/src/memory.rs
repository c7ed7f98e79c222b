//! Bounds-checked access to guest linear memory.
//!
//! All functions validate offset and length arguments against the guest's
//! linear memory size before touching it. Out-of-range access is an error
//! value (`ERR_BAD_POINTER` for the shim, a memory fault for the core),
//! never a panic.
//!
//! Guest pointers and lengths are wasm `i32` values carrying `u32` bits; they
//! are reinterpreted as unsigned before use, so memories above 2 GiB work.

use water_hostapi::ErrorCode;

/// Resolve `[off, off+len)` to a byte range inside a memory of `mem_size`.
pub fn checked_range(mem_size: usize, off: i32, len: i32) -> Result<std::ops::Range<usize>, i32> {
    let start = off as u32 as usize;
    let end = start
        .checked_add(len as u32 as usize)
        .ok_or(ErrorCode::BadPointer.as_i32())?;
    if end > mem_size {
        return Err(ErrorCode::BadPointer.as_i32());
    }
    Ok(start..end)
}

/// Borrow `[off, off+len)` of guest memory.
pub fn slice(mem: &[u8], off: i32, len: i32) -> Result<&[u8], i32> {
    let range = checked_range(mem.len(), off, len)?;
    Ok(&mem[range])
}

/// Mutably borrow `[off, off+len)` of guest memory.
pub fn slice_mut(mem: &mut [u8], off: i32, len: i32) -> Result<&mut [u8], i32> {
    let range = checked_range(mem.len(), off, len)?;
    Ok(&mut mem[range])
}

/// Host-owned transfer buffer inside guest memory.
///
/// After instantiation the core grows guest memory and reserves the new
/// pages for itself. `read`/`write` stage bytes here before handing the
/// guest an `(offset, len)` pair. The region never moves: linear memory
/// only grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRegion {
    /// Offset of the first byte in guest memory.
    pub base: usize,
    /// Number of bytes reserved.
    pub len: usize,
}

impl ScratchRegion {
    pub fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// The `(offset, len)` arguments for a transfer of up to `want` bytes.
    ///
    /// The offset carries the `u32` bits of `base`. The length stays
    /// positive as an `i32` so a guest result can still signal errors.
    pub fn window(&self, want: usize) -> (i32, i32) {
        let len = want.min(self.len).min(i32::MAX as usize);
        (self.base as u32 as i32, len as i32)
    }
}
