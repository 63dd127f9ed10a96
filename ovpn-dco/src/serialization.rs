// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use zeroize::Zeroizing;

use crate::proto::NONCE_TAIL_SIZE;

/// Cipher key material given as hex or base64 text.
#[derive(Debug)]
pub(crate) struct KeyBytes(pub Zeroizing<Vec<u8>>);

impl std::str::FromStr for KeyBytes {
    type Err = &'static str;

    // Hex wins for strings that are valid in both encodings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("Error: Empty key");
        }
        if s.len() % 2 == 0 {
            if let Ok(bytes) = hex::decode(s) {
                return Ok(KeyBytes(Zeroizing::new(bytes)));
            }
        }
        base64::decode(s)
            .map(|bytes| KeyBytes(Zeroizing::new(bytes)))
            .map_err(|_| "Error: Illegal character in key")
    }
}

/// The 8-byte nonce tail of one direction, hex or base64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NonceTail(pub [u8; NONCE_TAIL_SIZE]);

impl std::str::FromStr for NonceTail {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let KeyBytes(bytes) = s.parse()?;
        if bytes.len() != NONCE_TAIL_SIZE {
            return Err("Error: Illegal nonce tail size");
        }
        let mut tail = [0u8; NONCE_TAIL_SIZE];
        tail.copy_from_slice(&bytes);
        Ok(NonceTail(tail))
    }
}
