// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Throwable transport.
//!
//! A throwable crosses the wire as a NOT_NULL tag, the writer's local and
//! remote address strings, and the cause chain head-to-root, each entry
//! carrying a class name, a message and a pruned stack trace. Frames are
//! truncated at the first frame whose file name equals the skeleton dispatch
//! marker, so internal dispatch frames never leak to the peer.

use std::fmt;

use bytes::{Buf, BytesMut};

use crate::codec::{
    CodecError,
    wire::{get_opt_string, get_string, get_varuint, put_opt_string, put_string, put_varuint},
};

/// File name stamped on frames produced by the skeleton dispatch layer.
/// Pruning cuts the trace at the first frame carrying it.
pub const DISPATCH_MARKER_FILE: &str = "skeleton_dispatch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl StackFrame {
    pub fn new(function: &str, file: &str, line: u32) -> Self {
        Self {
            function: function.to_string(),
            file: file.to_string(),
            line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrowableEntry {
    pub class_name: String,
    pub message: String,
    pub frames: Vec<StackFrame>,
}

/// A transported throwable: the full cause chain, head first, stamped with
/// the addresses of the session that serialized it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireThrowable {
    pub local_address: String,
    pub remote_address: String,
    pub chain: Vec<ThrowableEntry>,
}

impl WireThrowable {
    pub fn new(class_name: &str, message: impl Into<String>) -> Self {
        Self {
            local_address: String::new(),
            remote_address: String::new(),
            chain: vec![ThrowableEntry {
                class_name: class_name.to_string(),
                message: message.into(),
                frames: Vec::new(),
            }],
        }
    }

    /// Appends `cause` to the root of the chain.
    pub fn caused_by(mut self, cause: WireThrowable) -> Self {
        self.chain.extend(cause.chain);
        self
    }

    pub fn with_frames(mut self, frames: Vec<StackFrame>) -> Self {
        if let Some(head) = self.chain.first_mut() {
            head.frames = frames;
        }
        self
    }

    pub fn class_name(&self) -> &str {
        self.chain.first().map(|e| e.class_name.as_str()).unwrap_or("")
    }

    pub fn message(&self) -> &str {
        self.chain.first().map(|e| e.message.as_str()).unwrap_or("")
    }

    pub fn cause_count(&self) -> usize {
        self.chain.len().saturating_sub(1)
    }

    /// Stamps the writing session's addresses. Called once on serialization.
    pub fn stamp(&mut self, local: &str, remote: &str) {
        if self.local_address.is_empty() {
            self.local_address = local.to_string();
        }
        if self.remote_address.is_empty() {
            self.remote_address = remote.to_string();
        }
    }

    /// Truncates every entry's frames at the dispatch marker file.
    pub fn prune(&mut self) {
        for entry in &mut self.chain {
            if let Some(cut) = entry
                .frames
                .iter()
                .position(|f| f.file == DISPATCH_MARKER_FILE)
            {
                entry.frames.truncate(cut);
            }
        }
    }
}

impl fmt::Display for WireThrowable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name(), self.message())?;
        if !self.remote_address.is_empty() {
            write!(f, " (at {})", self.remote_address)?;
        }
        for cause in self.chain.iter().skip(1) {
            write!(f, "; caused by {}: {}", cause.class_name, cause.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for WireThrowable {}

pub fn put_throwable(buf: &mut BytesMut, t: &WireThrowable) {
    buf.extend_from_slice(&[1u8]);
    put_opt_string(buf, Some(&t.local_address));
    put_opt_string(buf, Some(&t.remote_address));
    put_varuint(buf, t.chain.len() as u32);
    for entry in &t.chain {
        put_string(buf, &entry.class_name);
        put_string(buf, &entry.message);
        put_varuint(buf, entry.frames.len() as u32);
        for frame in &entry.frames {
            put_string(buf, &frame.function);
            put_string(buf, &frame.file);
            put_varuint(buf, frame.line);
        }
    }
}

pub fn get_throwable(buf: &mut impl Buf) -> Result<WireThrowable, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated(1));
    }
    if buf.get_u8() == 0 {
        return Err(CodecError::Invalid("null throwable".to_string()));
    }
    let local_address = get_opt_string(buf)?.unwrap_or_default();
    let remote_address = get_opt_string(buf)?.unwrap_or_default();
    let len = get_varuint(buf)?;
    if len == 0 {
        return Err(CodecError::Invalid("empty throwable chain".to_string()));
    }
    let mut chain = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let class_name = get_string(buf)?;
        let message = get_string(buf)?;
        let n_frames = get_varuint(buf)?;
        let mut frames = Vec::with_capacity(n_frames as usize);
        for _ in 0..n_frames {
            let function = get_string(buf)?;
            let file = get_string(buf)?;
            let line = get_varuint(buf)?;
            frames.push(StackFrame {
                function,
                file,
                line,
            });
        }
        chain.push(ThrowableEntry {
            class_name,
            message,
            frames,
        });
    }
    Ok(WireThrowable {
        local_address,
        remote_address,
        chain,
    })
}
