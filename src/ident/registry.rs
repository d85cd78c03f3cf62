// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-session object and type registries.
//!
//! Three keyed tables: a *strong* table of server-side skeletons (lifetime
//! ends on explicit dispose or session close), a *weak* table of local stubs
//! for peer objects (lifetime ends when the application drops its last
//! reference; the reclamation task observes the drop), and a strong table of
//! type descriptors with their stub/skeleton factories and a per-type export
//! counter.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicU32, Ordering},
};

use dashmap::DashMap;

use crate::{
    codec::value::LocalRemote,
    error::RemoteError,
    ident::{IdentBytes, VersionedIdentifier},
    remote::info::RemoteInfo,
    session::{
        skeleton::{Skeleton, SkeletonFactory, StubFactory},
        stub::Stub,
    },
};

#[derive(Clone)]
pub struct SkeletonEntry {
    pub id: VersionedIdentifier,
    pub skeleton: Arc<dyn Skeleton>,
    pub type_id: IdentBytes,
    target_ptr: usize,
}

pub struct TypeEntry {
    pub info: Arc<RemoteInfo>,
    pub stub_factory: Option<Arc<dyn StubFactory>>,
    pub skeleton_factory: Option<Arc<dyn SkeletonFactory>>,
    /// Live skeletons of this type; the type mapping is evicted when it
    /// returns to zero so future first-uses re-send the descriptor.
    pub exports: AtomicU32,
}

#[derive(Default)]
pub struct ObjectRegistry {
    skeletons: DashMap<IdentBytes, SkeletonEntry>,
    stubs: DashMap<IdentBytes, Weak<Stub>>,
    types: DashMap<IdentBytes, Arc<TypeEntry>>,
    catalog: DashMap<String, Arc<TypeEntry>>,
    names: DashMap<String, LocalRemote>,
    by_target: DashMap<usize, IdentBytes>,
    local_versions: DashMap<IdentBytes, u32>,
    remote_versions: DashMap<IdentBytes, u32>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type with its factories, keyed by interface name and by
    /// the deterministic type identifier.
    pub fn register_type(
        &self,
        info: Arc<RemoteInfo>,
        stub_factory: Option<Arc<dyn StubFactory>>,
        skeleton_factory: Option<Arc<dyn SkeletonFactory>>,
    ) {
        let entry = Arc::new(TypeEntry {
            info: Arc::clone(&info),
            stub_factory,
            skeleton_factory,
            exports: AtomicU32::new(0),
        });
        self.catalog.insert(info.name.clone(), Arc::clone(&entry));
        self.types.insert(info.type_id(), entry);
    }

    pub fn type_by_id(&self, type_id: &IdentBytes) -> Option<Arc<TypeEntry>> {
        self.types.get(type_id).map(|e| Arc::clone(e.value()))
    }

    pub fn type_by_name(&self, name: &str) -> Option<Arc<TypeEntry>> {
        self.catalog.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Adopts a peer-described type: reuses the catalog entry when the name
    /// is known locally (factories attached), otherwise keeps the descriptor
    /// alone.
    pub fn adopt_type(&self, info: Arc<RemoteInfo>) -> Arc<TypeEntry> {
        let type_id = info.type_id();
        if let Some(entry) = self.type_by_id(&type_id) {
            return entry;
        }
        let entry = match self.type_by_name(&info.name) {
            Some(local) if local.info.type_id() == type_id => local,
            _ => Arc::new(TypeEntry {
                info,
                stub_factory: None,
                skeleton_factory: None,
                exports: AtomicU32::new(0),
            }),
        };
        self.types.insert(type_id, Arc::clone(&entry));
        entry
    }

    /// Interns a local object: the same target always maps to the same
    /// identifier; first sight creates the skeleton through the registered
    /// factory and bumps the per-type export counter. Concurrent callers
    /// serialize on the target entry, so exactly one binding wins.
    pub fn identify(&self, local: &LocalRemote) -> Result<VersionedIdentifier, RemoteError> {
        let ptr = Arc::as_ptr(&local.target) as *const () as usize;
        if let Some(existing) = self.by_target.get(&ptr)
            && let Some(entry) = self.skeletons.get(existing.value())
        {
            return Ok(entry.id);
        }

        let factory = self
            .type_by_name(&local.info.name)
            .and_then(|e| e.skeleton_factory.clone())
            .ok_or_else(|| {
                RemoteError::Marshal(format!(
                    "no skeleton factory registered for {}",
                    local.info.name
                ))
            })?;

        match self.by_target.entry(ptr) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if let Some(entry) = self.skeletons.get(slot.get()) {
                    return Ok(entry.id);
                }
                // Disposed since the fast path; re-bind under the entry lock.
                let skeleton = factory.create(Arc::clone(&local.target))?;
                let id = self.mint_binding();
                self.insert_skeleton_entry(id, skeleton, ptr);
                slot.insert(id.key());
                Ok(id)
            },
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let skeleton = factory.create(Arc::clone(&local.target))?;
                let id = self.mint_binding();
                self.insert_skeleton_entry(id, skeleton, ptr);
                slot.insert(id.key());
                Ok(id)
            },
        }
    }

    fn mint_binding(&self) -> VersionedIdentifier {
        let id = VersionedIdentifier::mint();
        VersionedIdentifier::from_parts(id.key(), self.next_local_version(id.key()), 0)
    }

    /// Monotonic binding counter per identifier: zero on first use, bumped
    /// on every re-bind of the same 16 bytes.
    fn next_local_version(&self, key: IdentBytes) -> u32 {
        let mut slot = self.local_versions.entry(key).or_insert(0);
        let version = *slot;
        *slot = slot.wrapping_add(1);
        version
    }

    /// Inserts into the skeleton and type tables only; callers own the
    /// `by_target` mapping (the interning lock lives there).
    fn insert_skeleton_entry(
        &self,
        id: VersionedIdentifier,
        skeleton: Arc<dyn Skeleton>,
        target_ptr: usize,
    ) {
        let type_id = skeleton.info().type_id();
        if let Some(entry) = self.types.get(&type_id) {
            entry.exports.fetch_add(1, Ordering::SeqCst);
        }
        self.skeletons.insert(
            id.key(),
            SkeletonEntry {
                id,
                skeleton,
                type_id,
                target_ptr,
            },
        );
    }

    /// Binds a prebuilt skeleton under a caller-chosen identifier (completion
    /// callbacks, tentative batched-remote results). Re-binding the same
    /// bytes mints the next local version.
    pub fn register_skeleton(
        &self,
        id: VersionedIdentifier,
        skeleton: Arc<dyn Skeleton>,
    ) -> VersionedIdentifier {
        let bound = VersionedIdentifier::from_parts(
            id.key(),
            self.next_local_version(id.key()),
            id.remote_version,
        );
        let ptr = Arc::as_ptr(&skeleton.target()) as *const () as usize;
        self.insert_skeleton_entry(bound, skeleton, ptr);
        self.by_target.insert(ptr, bound.key());
        bound
    }

    pub fn try_retrieve_skeleton(&self, key: &IdentBytes) -> Option<SkeletonEntry> {
        self.skeletons.get(key).map(|e| e.value().clone())
    }

    /// Removes a skeleton; returns its type identifier and whether the
    /// type's counter hit zero (its mapping was evicted).
    pub fn remove_skeleton(&self, key: &IdentBytes) -> Option<(IdentBytes, bool)> {
        let (_, entry) = self.skeletons.remove(key)?;
        self.by_target.remove(&entry.target_ptr);
        let mut evicted = false;
        if let Some(type_entry) = self.types.get(&entry.type_id) {
            let left = type_entry.exports.fetch_sub(1, Ordering::SeqCst);
            if left <= 1 {
                evicted = true;
            }
        }
        if evicted {
            self.types.remove(&entry.type_id);
        }
        Some((entry.type_id, evicted))
    }

    /// Associates a stub with an identifier. Concurrent deserializations
    /// converge: the first live registration wins and every caller gets the
    /// same instance.
    pub fn register_stub<F>(
        &self,
        id: VersionedIdentifier,
        make: F,
    ) -> Result<Arc<Stub>, RemoteError>
    where
        F: FnOnce() -> Result<Arc<Stub>, RemoteError>,
    {
        match self.stubs.entry(id.key()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if let Some(live) = slot.get().upgrade() {
                    return Ok(live);
                }
                let fresh = make()?;
                slot.insert(Arc::downgrade(&fresh));
                Ok(fresh)
            },
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let fresh = make()?;
                slot.insert(Arc::downgrade(&fresh));
                Ok(fresh)
            },
        }
    }

    pub fn lookup_stub(&self, key: &IdentBytes) -> Option<Arc<Stub>> {
        self.stubs.get(key).and_then(|w| w.upgrade())
    }

    /// Drops the weak entry once the reclamation task confirmed the stub is
    /// gone. A live re-registration in the meantime is left alone.
    pub fn remove_stub_if_dead(&self, key: &IdentBytes) -> bool {
        if let Some(entry) = self.stubs.get(key) {
            if entry.value().upgrade().is_some() {
                return false;
            }
        } else {
            return false;
        }
        self.stubs.remove_if(key, |_, w| w.upgrade().is_none());
        true
    }

    /// Records the peer's latest version for an identifier. Returns whether
    /// the version changed, meaning the peer has re-bound the identifier;
    /// callers must then evict metadata cached under it ([`Self::evict_stub`])
    /// so stale bindings are not served.
    pub fn update_remote_version(&self, key: IdentBytes, version: u32) -> bool {
        let mut slot = self.remote_versions.entry(key).or_insert(version);
        if *slot == version {
            return false;
        }
        *slot = version;
        true
    }

    /// Drops the cached stub for an identifier the peer has re-bound, live
    /// or dead. The next resolution builds a fresh stub from the new
    /// descriptor; an application still holding the old stub keeps the old
    /// binding.
    pub fn evict_stub(&self, key: &IdentBytes) {
        self.stubs.remove(key);
    }

    pub fn remote_version(&self, key: &IdentBytes) -> Option<u32> {
        self.remote_versions.get(key).map(|v| *v)
    }

    /// Records a named export. The object itself is kept so a later lookup
    /// can re-bind after a peer-driven disposal removed the skeleton.
    pub fn export_name(&self, name: &str, obj: LocalRemote) {
        self.names.insert(name.to_string(), obj);
    }

    pub fn lookup_name(&self, name: &str) -> Option<LocalRemote> {
        self.names.get(name).map(|e| e.value().clone())
    }

    pub fn skeleton_count(&self) -> usize {
        self.skeletons.len()
    }

    /// Drops every skeleton, for session close.
    pub fn clear_skeletons(&self) {
        self.skeletons.clear();
        self.by_target.clear();
    }
}
