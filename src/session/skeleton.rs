// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server-side dispatch contract.
//!
//! A skeleton binds an identifier to a local object and dispatches decoded
//! selectors onto it. Without runtime code generation, dispatch is a match
//! over the selector index derived from the interface's [`RemoteInfo`]; the
//! session core drives flag behavior (asynchronous release, batching,
//! disposer unexport) so skeleton implementations stay plain.

use std::{any::Any, sync::Arc};

use crate::{
    codec::throwable::{StackFrame, WireThrowable},
    codec::value::Value,
    error::RemoteError,
    remote::info::RemoteInfo,
    session::{BoxFut, stub::Pipe},
};

pub trait Skeleton: Send + Sync + 'static {
    fn info(&self) -> Arc<RemoteInfo>;

    /// The implementation object, used to resolve loopback references to
    /// the local original.
    fn target(&self) -> Arc<dyn Any + Send + Sync>;

    /// Dispatches one decoded invocation onto the target.
    fn invoke(
        &self,
        selector: u32,
        args: Vec<Value>,
    ) -> BoxFut<'static, Result<Value, WireThrowable>>;

    /// Dispatches a pipe-mode invocation; the implementation owns the pipe
    /// and must close it.
    fn invoke_pipe(
        &self,
        selector: u32,
        args: Vec<Value>,
        pipe: Pipe,
    ) -> BoxFut<'static, Result<(), WireThrowable>> {
        let _ = (selector, args);
        Box::pin(async move {
            drop(pipe);
            Err(no_such_method(u32::MAX))
        })
    }
}

pub trait SkeletonFactory: Send + Sync {
    fn create(
        &self,
        target: Arc<dyn Any + Send + Sync>,
    ) -> Result<Arc<dyn Skeleton>, RemoteError>;
}

/// Wraps a raw stub into the application-facing typed proxy.
///
/// The produced wrapper is cached on the raw stub, so it must reference the
/// raw stub weakly; a strong reference would form a cycle and keep the pair
/// alive past the last application reference, blocking reclamation.
pub trait StubFactory: Send + Sync {
    fn create(&self, raw: &Arc<super::stub::Stub>) -> Arc<dyn Any + Send + Sync>;
}

/// Throwable for a selector the skeleton cannot dispatch, stamped with the
/// dispatch marker frame so it prunes like any internal frame.
pub fn no_such_method(selector: u32) -> WireThrowable {
    WireThrowable::new(
        "NoSuchMethodException",
        format!("no such method: selector {selector}"),
    )
    .with_frames(vec![StackFrame::new(
        "dispatch",
        crate::codec::throwable::DISPATCH_MARKER_FILE,
        0,
    )])
}

/// Downcast helper for skeleton implementations.
pub fn target_as<T: Any + Send + Sync>(
    target: &Arc<dyn Any + Send + Sync>,
) -> Result<Arc<T>, WireThrowable> {
    Arc::clone(target).downcast::<T>().map_err(|_| {
        WireThrowable::new("ClassCastException", "skeleton target has wrong type")
    })
}
