// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Globally unique object identifiers with version counters.
//!
//! An identifier is a 16-byte opaque value plus two 32-bit counters:
//!
//! * `local_version` — incremented whenever the local side mints a new
//!   binding for this identifier (e.g. a re-export after an interface
//!   upgrade);
//! * `remote_version` — the latest version observed from the peer.
//!
//! Identifiers are process-independent: the same 16 bytes on both peers
//! refer to the same object. Equality and hashing use the 16 bytes only, so
//! version drift never splits an identity.

pub mod registry;

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use crate::utils::generate_identifier;

/// Raw 16-byte identity, the map key form of a [`VersionedIdentifier`].
pub type IdentBytes = [u8; 16];

#[derive(Clone, Copy)]
pub struct VersionedIdentifier {
    bytes: IdentBytes,
    pub local_version: u32,
    pub remote_version: u32,
}

impl VersionedIdentifier {
    /// Mints a fresh identifier with both versions at zero.
    pub fn mint() -> Self {
        let (bytes, _) = generate_identifier();
        Self {
            bytes,
            local_version: 0,
            remote_version: 0,
        }
    }

    pub const fn from_parts(
        bytes: IdentBytes,
        local_version: u32,
        remote_version: u32,
    ) -> Self {
        Self {
            bytes,
            local_version,
            remote_version,
        }
    }

    pub const fn from_bytes(bytes: IdentBytes) -> Self {
        Self::from_parts(bytes, 0, 0)
    }

    #[inline]
    pub const fn bytes(&self) -> &IdentBytes {
        &self.bytes
    }

    #[inline]
    pub const fn key(&self) -> IdentBytes {
        self.bytes
    }

}

// Equality is on the 16-byte value alone; versions are advisory.
impl PartialEq for VersionedIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for VersionedIdentifier {}

impl Hash for VersionedIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for VersionedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.bytes {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for VersionedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VersionedIdentifier({self}, lv={}, rv={})",
            self.local_version, self.remote_version
        )
    }
}
