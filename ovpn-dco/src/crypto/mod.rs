// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Per-peer key material.
//!
//! A peer holds at most two [`KeySlot`]s: the primary one encrypts every
//! outgoing packet, either one may decrypt, picked by the key id carried
//! in the packet header. Rotation installs the new key as secondary, swaps
//! once the remote side starts using it and finally drops the old slot.

pub mod aead;
pub mod pktid;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use ring::aead::{LessSafeKey, UnboundKey, AES_128_GCM, AES_256_GCM, CHACHA20_POLY1305};
use zeroize::Zeroizing;

use crate::device::Error;
use crate::errors::DcoError;
use crate::proto::{KEY_ID_MAX, NONCE_TAIL_SIZE};
use pktid::{PacketIdRecv, PacketIdXmit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlg {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherAlg {
    pub fn key_len(self) -> usize {
        match self {
            CipherAlg::Aes128Gcm => 16,
            CipherAlg::Aes256Gcm | CipherAlg::ChaCha20Poly1305 => 32,
        }
    }

    fn algorithm(self) -> &'static ring::aead::Algorithm {
        match self {
            CipherAlg::Aes128Gcm => &AES_128_GCM,
            CipherAlg::Aes256Gcm => &AES_256_GCM,
            CipherAlg::ChaCha20Poly1305 => &CHACHA20_POLY1305,
        }
    }
}

impl FromStr for CipherAlg {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherAlg::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherAlg::Aes256Gcm),
            "chacha20-poly1305" => Ok(CipherAlg::ChaCha20Poly1305),
            _ => Err(Error::UnsupportedCipher(s.to_owned())),
        }
    }
}

impl fmt::Display for CipherAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherAlg::Aes128Gcm => "aes-128-gcm",
            CipherAlg::Aes256Gcm => "aes-256-gcm",
            CipherAlg::ChaCha20Poly1305 => "chacha20-poly1305",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlotPosition {
    Primary,
    Secondary,
}

impl FromStr for KeySlotPosition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(KeySlotPosition::Primary),
            "secondary" => Ok(KeySlotPosition::Secondary),
            _ => Err(Error::Config(format!("invalid key slot {}", s))),
        }
    }
}

impl fmt::Display for KeySlotPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySlotPosition::Primary => f.write_str("primary"),
            KeySlotPosition::Secondary => f.write_str("secondary"),
        }
    }
}

/// Key and nonce tail for one direction.
#[derive(Clone)]
pub struct KeyDirection {
    pub cipher_key: Zeroizing<Vec<u8>>,
    pub nonce_tail: [u8; NONCE_TAIL_SIZE],
}

impl fmt::Debug for KeyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDirection")
            .field("cipher_key", &"<redacted>")
            .finish()
    }
}

/// Everything the control plane hands over to install one key slot.
#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub key_id: u8,
    pub cipher: CipherAlg,
    pub encrypt: KeyDirection,
    pub decrypt: KeyDirection,
}

/// One key generation: a cipher pair plus its packet id state.
#[derive(Debug)]
pub struct KeySlot {
    key_id: u8,
    cipher: CipherAlg,
    encrypt_key: LessSafeKey,
    decrypt_key: LessSafeKey,
    nonce_tail_xmit: [u8; NONCE_TAIL_SIZE],
    nonce_tail_recv: [u8; NONCE_TAIL_SIZE],
    pid_xmit: PacketIdXmit,
    pid_recv: PacketIdRecv,
}

impl KeySlot {
    pub fn new(config: &KeyConfig) -> Result<KeySlot, Error> {
        if config.key_id >= KEY_ID_MAX {
            return Err(Error::InvalidKeyId(config.key_id));
        }

        let expected = config.cipher.key_len();
        for dir in [&config.encrypt, &config.decrypt] {
            if dir.cipher_key.len() != expected {
                return Err(Error::KeyMaterialSizeMismatch {
                    expected,
                    got: dir.cipher_key.len(),
                });
            }
        }

        let make_key = |key: &[u8]| {
            UnboundKey::new(config.cipher.algorithm(), key)
                .map(LessSafeKey::new)
                .map_err(|_| Error::KeyMaterialSizeMismatch {
                    expected,
                    got: key.len(),
                })
        };

        Ok(KeySlot {
            key_id: config.key_id,
            cipher: config.cipher,
            encrypt_key: make_key(&config.encrypt.cipher_key)?,
            decrypt_key: make_key(&config.decrypt.cipher_key)?,
            nonce_tail_xmit: config.encrypt.nonce_tail,
            nonce_tail_recv: config.decrypt.nonce_tail,
            pid_xmit: PacketIdXmit::default(),
            pid_recv: PacketIdRecv::default(),
        })
    }

    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    pub fn cipher(&self) -> CipherAlg {
        self.cipher
    }

    pub fn pid_xmit(&self) -> &PacketIdXmit {
        &self.pid_xmit
    }

    pub fn pid_recv(&self) -> &PacketIdRecv {
        &self.pid_recv
    }

    #[cfg(test)]
    pub(crate) fn with_pid_xmit(mut self, pid_xmit: PacketIdXmit) -> Self {
        self.pid_xmit = pid_xmit;
        self
    }
}

#[derive(Debug, Default)]
struct Slots {
    primary: Option<Arc<KeySlot>>,
    secondary: Option<Arc<KeySlot>>,
}

/// The key slots of one peer.
///
/// Slot changes and slot selection are serialized by a short lock; a
/// selected slot is an `Arc`, so packets already holding it finish with
/// the old key even if it is swapped out or deleted meanwhile.
#[derive(Debug, Default)]
pub struct CryptoState {
    slots: Mutex<Slots>,
}

impl CryptoState {
    /// Slot used for encryption.
    pub fn primary(&self) -> Result<Arc<KeySlot>, DcoError> {
        self.slots.lock().primary.clone().ok_or(DcoError::NoPrimaryKey)
    }

    /// Exact match on key id, primary first.
    pub fn by_key_id(&self, key_id: u8) -> Result<Arc<KeySlot>, DcoError> {
        let slots = self.slots.lock();
        let found = slots
            .primary
            .iter()
            .chain(slots.secondary.iter())
            .find(|slot| slot.key_id == key_id)
            .cloned();
        found.ok_or(DcoError::NoMatchingKey)
    }

    /// Install a slot, replacing whatever occupied that position.
    pub fn install(&self, position: KeySlotPosition, slot: KeySlot) {
        let slot = Some(Arc::new(slot));
        let mut slots = self.slots.lock();
        match position {
            KeySlotPosition::Primary => slots.primary = slot,
            KeySlotPosition::Secondary => slots.secondary = slot,
        }
    }

    pub fn swap(&self) {
        let mut slots = self.slots.lock();
        let slots = &mut *slots;
        std::mem::swap(&mut slots.primary, &mut slots.secondary);
    }

    /// Returns true if the position held a key.
    pub fn delete(&self, position: KeySlotPosition) -> bool {
        let mut slots = self.slots.lock();
        match position {
            KeySlotPosition::Primary => slots.primary.take().is_some(),
            KeySlotPosition::Secondary => slots.secondary.take().is_some(),
        }
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock();
        slots.primary = None;
        slots.secondary = None;
    }

    /// `(position, key_id, cipher, last transmitted packet id)` per
    /// installed slot.
    pub fn describe(&self) -> Vec<(KeySlotPosition, u8, CipherAlg, u32)> {
        let slots = self.slots.lock();
        let mut out = Vec::with_capacity(2);
        if let Some(s) = &slots.primary {
            out.push((KeySlotPosition::Primary, s.key_id, s.cipher, s.pid_xmit.last()));
        }
        if let Some(s) = &slots.secondary {
            out.push((KeySlotPosition::Secondary, s.key_id, s.cipher, s.pid_xmit.last()));
        }
        out
    }
}
