//! Owned byte buffers staged for delivery to a session worker
//!
//! A buffer either adopts caller memory (no copy) or duplicates it. It is
//! immutable once built; holders replace it wholesale.

use std::fmt;

/// Opaque message buffer
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SrvBuffer {
    bytes: Vec<u8>,
}

impl SrvBuffer {
    /// Build a buffer, copying `bytes` when `duplicate` is set
    ///
    /// Without `duplicate` the vector is adopted as-is.
    pub fn new(bytes: Vec<u8>, duplicate: bool) -> Self {
        if duplicate {
            Self::duplicate(&bytes)
        } else {
            Self::adopt(bytes)
        }
    }

    /// Take ownership of `bytes` without copying
    pub fn adopt(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Copy `src` into freshly allocated storage
    ///
    /// If the allocation fails the buffer comes back empty.
    pub fn duplicate(src: &[u8]) -> Self {
        if src.is_empty() {
            return Self::default();
        }
        let mut bytes = Vec::new();
        if let Err(e) = bytes.try_reserve_exact(src.len()) {
            tracing::warn!(len = src.len(), error = %e, "buffer duplication failed");
            return Self::default();
        }
        bytes.extend_from_slice(src);
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Address of the payload, for checking adoption
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    /// Free the payload now; a no-op on an empty buffer
    pub fn release(&mut self) {
        self.bytes = Vec::new();
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for SrvBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrvBuffer").field("len", &self.bytes.len()).finish()
    }
}

impl From<&[u8]> for SrvBuffer {
    fn from(src: &[u8]) -> Self {
        Self::duplicate(src)
    }
}

impl From<Vec<u8>> for SrvBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::adopt(bytes)
    }
}
