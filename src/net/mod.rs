// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright lrwpan-tsch Contributors 2025.

//! Wire formats shared by the MAC sublayer.

pub mod fcs;
pub mod ieee802154;
pub mod stream;

use thiserror::Error;

/// Errors surfaced by the frame codec on malformed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame truncated")]
    FrameTooShort,
    #[error("frame check sequence mismatch")]
    FcsMismatch,
    #[error("reserved frame type or address mode")]
    ReservedType,
    #[error("unsupported frame version")]
    UnsupportedVersion,
    #[error("unsupported information element")]
    UnsupportedIe,
}
