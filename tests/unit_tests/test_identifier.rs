// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{any::Any, collections::HashSet, sync::Arc, time::Duration};

use rmi_session_rs::{
    channel::Channel,
    codec::{throwable::WireThrowable, value::Value},
    error::RemoteError,
    ident::{VersionedIdentifier, registry::ObjectRegistry},
    remote::{completion::Completion, info::RemoteInfo},
    scheduler::TaskHandle,
    session::{
        BoxFut,
        skeleton::Skeleton,
        stub::{Batch, Pipe, PipeHome, Stub, StubSupport},
    },
};

struct NullSkeleton {
    info: Arc<RemoteInfo>,
    target: Arc<dyn Any + Send + Sync>,
}

impl NullSkeleton {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            info: Arc::new(RemoteInfo::builder("test.Null").build()),
            target: Arc::new(()),
        })
    }
}

impl Skeleton for NullSkeleton {
    fn info(&self) -> Arc<RemoteInfo> {
        Arc::clone(&self.info)
    }

    fn target(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.target)
    }

    fn invoke(
        &self,
        _selector: u32,
        _args: Vec<Value>,
    ) -> BoxFut<'static, Result<Value, WireThrowable>> {
        Box::pin(std::future::ready(Ok(Value::Null)))
    }
}

/// Inert support for building raw stubs; no test below ever invokes.
struct NullSupport;

impl StubSupport for NullSupport {
    fn session_addresses(&self) -> (String, String) {
        (String::new(), String::new())
    }

    fn is_session_closed(&self) -> bool {
        false
    }

    fn prepare_args(&self, args: Vec<Value>) -> Result<Vec<Value>, RemoteError> {
        Ok(args)
    }

    fn resolve_value(&self, value: Value) -> BoxFut<'_, Result<Value, RemoteError>> {
        Box::pin(std::future::ready(Ok(value)))
    }

    fn invoke(
        &self,
        _id: VersionedIdentifier,
    ) -> BoxFut<'_, Result<Channel, RemoteError>> {
        unimplemented!()
    }

    fn schedule_timeout(
        &self,
        _ch: &Channel,
        _timeout: Duration,
    ) -> Result<TaskHandle, RemoteError> {
        unimplemented!()
    }

    fn finished(&self, ch: Channel, _reset: bool) {
        ch.kill();
    }

    fn finished_and_cancel_timeout(
        &self,
        _ch: Channel,
        _reset: bool,
        _timeout: TaskHandle,
    ) -> bool {
        unimplemented!()
    }

    fn failed(&self, _ch: Channel, _cause: RemoteError) -> RemoteError {
        unimplemented!()
    }

    fn failed_and_cancel_timeout(
        &self,
        _ch: Channel,
        _cause: RemoteError,
        _timeout: TaskHandle,
        _budget: Duration,
    ) -> RemoteError {
        unimplemented!()
    }

    fn batched(&self, _batch: &mut Batch, _ch: Channel) {
        unimplemented!()
    }

    fn batched_and_cancel_timeout(
        &self,
        _batch: &mut Batch,
        _ch: Channel,
        _timeout: TaskHandle,
    ) -> bool {
        unimplemented!()
    }

    fn unbatch(&self, _batch: &mut Batch) -> Option<Channel> {
        None
    }

    fn rebatch(&self, _batch: &mut Batch, ch: Option<Channel>) {
        if let Some(ch) = ch {
            ch.kill();
        }
    }

    fn release(&self, _ch: Channel) -> Pipe {
        unimplemented!()
    }

    fn recycle_pipe(&self, ch: Channel, _home: PipeHome) {
        ch.kill();
    }

    fn create_completion(&self) -> Result<(Completion, Value), RemoteError> {
        unimplemented!()
    }

    fn create_batched_remote(
        &self,
        _info: Arc<RemoteInfo>,
    ) -> Result<(Arc<Stub>, VersionedIdentifier), RemoteError> {
        unimplemented!()
    }

    fn flush_batch<'a>(
        &'a self,
        _batch: &'a mut Batch,
    ) -> BoxFut<'a, Result<(), RemoteError>> {
        unimplemented!()
    }

    fn dispose_support(&self, _id: VersionedIdentifier) -> Arc<dyn StubSupport> {
        unimplemented!()
    }
}

#[test]
fn test_equality_ignores_versions() {
    let a = VersionedIdentifier::from_parts([1u8; 16], 0, 0);
    let b = VersionedIdentifier::from_parts([1u8; 16], 5, 7);
    assert_eq!(a, b);

    let mut set = HashSet::new();
    set.insert(a);
    assert!(set.contains(&b));

    let c = VersionedIdentifier::from_parts([2u8; 16], 0, 0);
    assert_ne!(a, c);
}

#[test]
fn test_minted_identifiers_are_unique() {
    let mut seen = HashSet::new();
    for _ in 0..64 {
        assert!(seen.insert(VersionedIdentifier::mint()));
    }
}

#[test]
fn test_rebinding_bumps_local_version() {
    let registry = ObjectRegistry::new();
    let id = VersionedIdentifier::mint();

    let first = registry.register_skeleton(id, NullSkeleton::new());
    assert_eq!(first.local_version, 0);

    registry.remove_skeleton(&first.key());
    let second = registry.register_skeleton(id, NullSkeleton::new());
    assert_eq!(second.local_version, 1);
    assert_eq!(first, second);
}

#[test]
fn test_remote_version_updates_monotonically_observed() {
    let registry = ObjectRegistry::new();
    let key = [3u8; 16];

    assert!(!registry.update_remote_version(key, 0), "first sight records");
    assert!(!registry.update_remote_version(key, 0), "same version is quiet");
    assert!(registry.update_remote_version(key, 1), "bump is observed");
    assert_eq!(registry.remote_version(&key), Some(1));
}

#[test]
fn test_rebind_evicts_cached_stub() {
    let registry = ObjectRegistry::new();
    let info = Arc::new(RemoteInfo::builder("test.Null").build());
    let support: Arc<dyn StubSupport> = Arc::new(NullSupport);
    let id = VersionedIdentifier::from_parts([8u8; 16], 0, 0);

    let first = registry
        .register_stub(id, || {
            Ok(Arc::new(Stub::new(
                id,
                RemoteInfo::type_id(&info),
                Arc::clone(&info),
                Arc::clone(&support),
                None,
            )))
        })
        .expect("first stub");

    // Same version: the live instance is reused as-is.
    assert!(!registry.update_remote_version(id.key(), 0));
    let cached = registry
        .register_stub(id, || panic!("cached stub must be reused"))
        .expect("cached stub");
    assert!(Arc::ptr_eq(&first, &cached));

    // A version bump means the peer re-bound the identifier: the cached
    // stub is evicted and the next registration builds a fresh one, even
    // though the old instance is still live.
    assert!(registry.update_remote_version(id.key(), 1));
    registry.evict_stub(&id.key());

    let rebound = VersionedIdentifier::from_parts(id.key(), 1, 0);
    let fresh = registry
        .register_stub(rebound, || {
            Ok(Arc::new(Stub::new(
                rebound,
                RemoteInfo::type_id(&info),
                Arc::clone(&info),
                Arc::clone(&support),
                None,
            )))
        })
        .expect("fresh stub");
    assert!(
        !Arc::ptr_eq(&first, &fresh),
        "a re-bound identifier must not serve the stale stub"
    );
    assert_eq!(fresh.identifier().local_version, 1);
    assert_eq!(first.identifier().local_version, 0);
}

#[test]
fn test_skeleton_table_lifecycle() {
    let registry = ObjectRegistry::new();
    let id = VersionedIdentifier::mint();
    let bound = registry.register_skeleton(id, NullSkeleton::new());

    assert_eq!(registry.skeleton_count(), 1);
    assert!(registry.try_retrieve_skeleton(&bound.key()).is_some());

    assert!(registry.remove_skeleton(&bound.key()).is_some());
    assert_eq!(registry.skeleton_count(), 0);
    assert!(registry.try_retrieve_skeleton(&bound.key()).is_none());
    assert!(registry.remove_skeleton(&bound.key()).is_none());
}
