//! Installs compiled machine code into pages marked executable and, once
//! the code is copied in, no longer writable — matching the spec's
//! requirement that native code run from protected pages. Backed by the
//! `region` crate, the same executable-page primitive `cranelift-jit`
//! (the JIT stack used by this corpus's closest sibling runtime) relies
//! on internally; we take it as a direct dependency since our backends
//! emit their own machine code rather than going through Cranelift.

use region::Protection;

use crate::error::JitError;

/// A page-aligned, read-execute-only mapping holding one function's
/// compiled body. Dropping it unmaps the pages.
pub struct ExecutableMemory {
    allocation: region::Allocation,
    len: usize,
}

// The pages are read-execute only after `install`; nothing mutates them
// afterward, so sharing the pointer across threads is sound.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    pub fn install(code: &[u8]) -> Result<Self, JitError> {
        if code.is_empty() {
            return Err(JitError::MmapFailed { detail: "empty code buffer".into() });
        }
        let mut allocation = region::alloc(code.len(), Protection::READ_WRITE)
            .map_err(|e| JitError::MmapFailed { detail: e.to_string() })?;

        // Safety: `allocation` was just mapped read-write by us and is
        // sized to exactly `code.len()` bytes.
        unsafe {
            let dst = std::slice::from_raw_parts_mut(allocation.as_mut_ptr::<u8>(), code.len());
            dst.copy_from_slice(code);
        }

        // Safety: `allocation`'s pointer/length describe the mapping we
        // just wrote; downgrading to read-execute makes it immutable.
        unsafe {
            region::protect(allocation.as_ptr::<u8>(), code.len(), Protection::READ_EXECUTE)
                .map_err(|e| JitError::MmapFailed { detail: e.to_string() })?;
        }

        Ok(ExecutableMemory { allocation, len: code.len() })
    }

    pub fn entry_ptr(&self, entry_offset: usize) -> *const u8 {
        debug_assert!(entry_offset < self.len);
        unsafe { self.allocation.as_ptr::<u8>().add(entry_offset) }
    }

    pub fn len(&self) -> usize {
        self.len
    }
}
