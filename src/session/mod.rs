// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod admin;
pub mod reclaim;
pub mod session;
pub mod skeleton;
pub mod stub;

pub use session::Session;

use std::{pin::Pin, sync::Arc};

use crate::{
    codec::value::LocalRemote,
    remote::info::RemoteInfo,
    session::skeleton::{SkeletonFactory, StubFactory},
};

/// Boxed future used across the dyn seams of the session.
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything a peer offers at session establishment: type registrations,
/// named exports, and the optional shared server object exchanged during the
/// handshake.
#[derive(Default)]
pub struct Exports {
    pub(crate) types: Vec<TypeRegistration>,
    pub(crate) named: Vec<(String, LocalRemote)>,
    pub(crate) shared: Option<LocalRemote>,
}

pub(crate) struct TypeRegistration {
    pub info: Arc<RemoteInfo>,
    pub stub_factory: Option<Arc<dyn StubFactory>>,
    pub skeleton_factory: Option<Arc<dyn SkeletonFactory>>,
}

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type so objects of it can cross the wire in either
    /// direction.
    pub fn register_type(
        mut self,
        info: Arc<RemoteInfo>,
        stub_factory: Option<Arc<dyn StubFactory>>,
        skeleton_factory: Option<Arc<dyn SkeletonFactory>>,
    ) -> Self {
        self.types.push(TypeRegistration {
            info,
            stub_factory,
            skeleton_factory,
        });
        self
    }

    /// Exposes `obj` under `name` for peer `lookup`.
    pub fn export(mut self, name: &str, obj: LocalRemote) -> Self {
        self.named.push((name.to_string(), obj));
        self
    }

    /// Deposits the shared server object delivered to the peer's `receive`.
    pub fn share(mut self, obj: LocalRemote) -> Self {
        self.shared = Some(obj);
        self
    }
}
