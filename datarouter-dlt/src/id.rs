// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::hash::{Hash, Hasher};
use zwohash::ZwoHasher;

/// Fixed 4-byte DLT identifier (application, context, channel or ECU name),
/// NUL-padded when shorter. Equality and hashing go through a cached 32-bit
/// hash of the padded bytes.
#[derive(Clone, Copy)]
pub struct DltId {
    bytes: [u8; 4],
    value: u32,
}

impl DltId {
    pub const SIZE: usize = 4;

    pub fn new(name: &str) -> DltId {
        let mut bytes = [0u8; 4];
        for (dst, src) in bytes.iter_mut().zip(name.bytes()) {
            *dst = src;
        }
        DltId::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: [u8; 4]) -> DltId {
        let mut hasher = ZwoHasher::default();
        bytes.hash(&mut hasher);
        DltId {
            bytes,
            value: hasher.finish() as u32,
        }
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.bytes
    }

    /// The name without trailing NUL padding. Lossy for non-UTF-8 ids, which
    /// only occur on malformed peer input.
    pub fn display_name(&self) -> String {
        let end = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(Self::SIZE);
        String::from_utf8_lossy(&self.bytes[..end]).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == [0u8; 4]
    }
}

impl Default for DltId {
    fn default() -> Self {
        DltId::from_bytes([0u8; 4])
    }
}

impl PartialEq for DltId {
    fn eq(&self, other: &DltId) -> bool {
        self.value == other.value
    }
}

impl Eq for DltId {}

impl Hash for DltId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.value);
    }
}

impl fmt::Debug for DltId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DltId({:?})", self.display_name())
    }
}

impl fmt::Display for DltId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

impl From<&str> for DltId {
    fn from(name: &str) -> Self {
        DltId::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorter_names_are_nul_padded() {
        let id = DltId::new("AB");
        assert_eq!(id.as_bytes(), b"AB\0\0");
        assert_eq!(id.display_name(), "AB");
    }

    #[test]
    fn longer_names_are_cut_to_four_bytes() {
        let id = DltId::new("TOOLONG");
        assert_eq!(id.as_bytes(), b"TOOL");
    }

    #[test]
    fn equality_via_cached_hash() {
        assert_eq!(DltId::new("APP0"), DltId::from_bytes(*b"APP0"));
        assert_ne!(DltId::new("APP0"), DltId::new("APP1"));
        assert!(DltId::default().is_empty());
    }

    #[test]
    fn usable_as_map_key() {
        let mut map = std::collections::HashMap::new();
        map.insert(DltId::new("DFLT"), 1usize);
        assert_eq!(map.get(&DltId::new("DFLT")), Some(&1));
    }
}
