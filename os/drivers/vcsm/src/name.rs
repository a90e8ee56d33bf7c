//! Fixed-capacity resource name.

use core::fmt;
use vcsm_abi::RESOURCE_NAME_LEN;

#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResourceName {
    bytes: [u8; RESOURCE_NAME_LEN],
    len: usize,
}

impl ResourceName {
    /// Copies `name`, cutting it at the last character boundary that fits.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(RESOURCE_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0; RESOURCE_NAME_LEN];
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self { bytes, len }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
