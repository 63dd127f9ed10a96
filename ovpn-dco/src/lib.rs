// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Userspace implementation of the OpenVPN data channel offload engine.
//!
//! Keys are negotiated elsewhere; this crate takes them from the control
//! plane and moves DATA_V2 packets between a transport (UDP or TCP) and a
//! virtual interface: peer lookup, AEAD sealing and opening, replay
//! protection, peer floating and keepalive.

pub mod config;
pub mod crypto;
pub mod device;
pub mod errors;
pub mod proto;

#[cfg(not(feature = "mock-instant"))]
pub(crate) mod sleepyinstant;

pub(crate) mod serialization;

/// Clock used for every timer in the crate.
#[cfg(feature = "mock-instant")]
pub use mock_instant::Instant;
#[cfg(not(feature = "mock-instant"))]
pub use sleepyinstant::Instant;
