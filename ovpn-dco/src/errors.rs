// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

/// Reasons a single packet is dropped or a key slot becomes unusable.
///
/// None of these are fatal to the peer: the data path counts the drop and
/// moves on. Peer-fatal conditions are expressed as a [`DeleteReason`].
///
/// [`DeleteReason`]: crate::device::DeleteReason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcoError {
    MalformedHeader,
    NoMatchingKey,
    NoPrimaryKey,
    AuthenticationFailed,
    ReplayOrTooOld,
    InsufficientHeadroom,
    /// The 32-bit transmit counter of the key slot is spent, the slot must
    /// be rotated before anything else can be sent with it.
    PacketIdExhausted,
    CipherError,
    UnsupportedProtocol,
    NoPeer,
    NoBinding,
    ReversePathMismatch,
    /// A TCP peer already has a frame waiting for write space.
    TransportBusy,
    TransportError,
}
