// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod input;
pub mod output;
pub mod throwable;
pub mod value;
pub mod wire;

use thiserror::Error;

/// Decode-side failure of the invocation wire format.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated frame: needed {0} more bytes")]
    Truncated(usize),

    #[error("malformed frame: {0}")]
    Invalid(String),
}

/// First byte of every invocation response.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Throwable = 1,
    BatchAck = 2,
}

impl Status {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Ok,
            1 => Self::Throwable,
            2 => Self::BatchAck,
            _ => return None,
        })
    }
}
