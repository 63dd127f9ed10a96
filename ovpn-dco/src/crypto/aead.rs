// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::convert::TryInto;

use ring::aead::{Aad, Nonce};

use super::{CryptoState, KeySlot};
use crate::errors::DcoError;
use crate::proto::{
    nonce_compose, opcode_compose, DataHeader, AUTH_TAG_SIZE, DATA_HEADER_SIZE,
    DATA_OVERHEAD_SZ, DATA_V2, OP_SIZE_V2,
};

/// Seal `src` into `dst` as a DATA_V2 packet for `peer_id`.
///
/// The packet id is taken from the slot before anything else happens, so
/// even a failed seal consumes it. Returns the part of `dst` holding the
/// wire packet.
pub fn encrypt<'a>(
    peer_id: u32,
    slot: &KeySlot,
    src: &[u8],
    dst: &'a mut [u8],
) -> Result<&'a mut [u8], DcoError> {
    let total = src.len() + DATA_OVERHEAD_SZ;
    if dst.len() < total {
        return Err(DcoError::InsufficientHeadroom);
    }

    let packet_id = slot.pid_xmit.next()?;
    let nonce = nonce_compose(packet_id, &slot.nonce_tail_xmit);

    let (header, rest) = dst.split_at_mut(DATA_HEADER_SIZE);
    header[..OP_SIZE_V2]
        .copy_from_slice(&opcode_compose(DATA_V2, slot.key_id, peer_id).to_be_bytes());
    header[OP_SIZE_V2..].copy_from_slice(&packet_id.to_be_bytes());

    let (payload, tag_out) = rest.split_at_mut(src.len());
    payload.copy_from_slice(src);

    let tag = slot
        .encrypt_key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(&*header),
            payload,
        )
        .map_err(|_| DcoError::CipherError)?;
    tag_out[..AUTH_TAG_SIZE].copy_from_slice(tag.as_ref());

    Ok(&mut dst[..total])
}

/// Open a DATA_V2 packet in place with the matching slot of `crypto`.
///
/// The replay window is consulted before the AEAD runs and only updated
/// after the packet authenticated, so forged packets never move it.
pub fn decrypt<'a>(crypto: &CryptoState, packet: &'a mut [u8]) -> Result<&'a mut [u8], DcoError> {
    let (key_id, packet_id) = {
        let header = DataHeader::parse(packet)?;
        (header.key_id, header.packet_id)
    };
    let slot = crypto.by_key_id(key_id)?;
    decrypt_with_slot(&slot, packet_id, packet)
}

fn decrypt_with_slot<'a>(
    slot: &KeySlot,
    packet_id: u32,
    packet: &'a mut [u8],
) -> Result<&'a mut [u8], DcoError> {
    slot.pid_recv.will_accept(packet_id)?;

    let nonce = nonce_compose(packet_id, &slot.nonce_tail_recv);
    let (header, rest) = packet.split_at_mut(DATA_HEADER_SIZE);
    let aad: [u8; DATA_HEADER_SIZE] = (&*header)
        .try_into()
        .map_err(|_| DcoError::MalformedHeader)?;

    let plaintext = slot
        .decrypt_key
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), rest)
        .map_err(|_| DcoError::AuthenticationFailed)?;

    slot.pid_recv.mark_did_receive(packet_id)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::pktid::PacketIdXmit;
    use crate::crypto::tests::key_pair;
    use crate::crypto::{CipherAlg, KeySlotPosition};
    use crate::proto::{key_id_from_packet, peer_id_from_packet};

    fn sealed(peer_id: u32, slot: &KeySlot, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; payload.len() + DATA_OVERHEAD_SZ];
        encrypt(peer_id, slot, payload, &mut buf).unwrap().to_vec()
    }

    fn receiver(config: &crate::crypto::KeyConfig) -> CryptoState {
        let state = CryptoState::default();
        state.install(KeySlotPosition::Primary, KeySlot::new(config).unwrap());
        state
    }

    #[test]
    fn round_trip_all_ciphers() {
        for cipher in [
            CipherAlg::Aes128Gcm,
            CipherAlg::Aes256Gcm,
            CipherAlg::ChaCha20Poly1305,
        ] {
            let (a, b) = key_pair(3, cipher);
            let tx = KeySlot::new(&a).unwrap();
            let rx = receiver(&b);

            let payload = b"an inner ip packet would go here".to_vec();
            let mut packet = sealed(0x00ABCD, &tx, &payload);
            assert_eq!(packet.len(), payload.len() + DATA_OVERHEAD_SZ);
            assert_eq!(peer_id_from_packet(&packet), Some(0x00ABCD));
            assert_eq!(key_id_from_packet(&packet), Some(3));
            assert_eq!(&packet[4..8], &1u32.to_be_bytes());

            let plain = decrypt(&rx, &mut packet).unwrap();
            assert_eq!(plain, &payload[..]);
        }
    }

    #[test]
    fn empty_payload() {
        let (a, b) = key_pair(0, CipherAlg::Aes256Gcm);
        let tx = KeySlot::new(&a).unwrap();
        let rx = receiver(&b);
        let mut packet = sealed(1, &tx, &[]);
        assert!(decrypt(&rx, &mut packet).unwrap().is_empty());
    }

    #[test]
    fn headroom_is_checked() {
        let (a, _) = key_pair(0, CipherAlg::Aes256Gcm);
        let tx = KeySlot::new(&a).unwrap();
        let mut buf = vec![0u8; 10 + DATA_OVERHEAD_SZ - 1];
        assert_eq!(
            encrypt(1, &tx, &[0u8; 10], &mut buf).unwrap_err(),
            DcoError::InsufficientHeadroom
        );
        // Nothing was consumed
        assert_eq!(tx.pid_xmit().last(), 0);
    }

    #[test]
    fn replayed_packet_is_rejected() {
        let (a, b) = key_pair(0, CipherAlg::Aes256Gcm);
        let tx = KeySlot::new(&a)
            .unwrap()
            .with_pid_xmit(PacketIdXmit::starting_at(4));
        let rx = receiver(&b);

        let p5 = sealed(9, &tx, b"five");
        let p6 = sealed(9, &tx, b"six");
        let p7 = sealed(9, &tx, b"seven");

        assert!(decrypt(&rx, &mut p5.clone()).is_ok());
        assert!(decrypt(&rx, &mut p6.clone()).is_ok());
        assert!(decrypt(&rx, &mut p7.clone()).is_ok());
        assert_eq!(
            decrypt(&rx, &mut p6.clone()).unwrap_err(),
            DcoError::ReplayOrTooOld
        );
    }

    #[test]
    fn tampering_is_detected_and_does_not_burn_the_id() {
        let (a, b) = key_pair(0, CipherAlg::ChaCha20Poly1305);
        let tx = KeySlot::new(&a).unwrap();
        let rx = receiver(&b);

        let good = sealed(2, &tx, b"payload");
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 1;
        assert_eq!(
            decrypt(&rx, &mut bad).unwrap_err(),
            DcoError::AuthenticationFailed
        );

        // Header bits are authenticated too
        let mut bad = good.clone();
        bad[3] ^= 1;
        assert_eq!(
            decrypt(&rx, &mut bad).unwrap_err(),
            DcoError::AuthenticationFailed
        );

        assert!(decrypt(&rx, &mut good.clone()).is_ok());
    }

    #[test]
    fn wrong_key_or_key_id() {
        let (a, _) = key_pair(0, CipherAlg::Aes128Gcm);
        let (_, other) = key_pair(0, CipherAlg::Aes128Gcm);
        let tx = KeySlot::new(&a).unwrap();

        let rx = receiver(&other);
        let mut packet = sealed(2, &tx, b"payload");
        assert_eq!(
            decrypt(&rx, &mut packet.clone()).unwrap_err(),
            DcoError::AuthenticationFailed
        );

        let (_, id5) = key_pair(5, CipherAlg::Aes128Gcm);
        let rx = receiver(&id5);
        assert_eq!(
            decrypt(&rx, &mut packet).unwrap_err(),
            DcoError::NoMatchingKey
        );
    }

    #[test]
    fn truncated_packet_is_malformed() {
        let (a, b) = key_pair(0, CipherAlg::Aes128Gcm);
        let tx = KeySlot::new(&a).unwrap();
        let rx = receiver(&b);
        let packet = sealed(2, &tx, b"");
        let mut short = packet[..packet.len() - 1].to_vec();
        assert_eq!(
            decrypt(&rx, &mut short).unwrap_err(),
            DcoError::MalformedHeader
        );
    }

    #[test]
    fn exhausted_slot_refuses_to_seal() {
        let (a, _) = key_pair(0, CipherAlg::Aes256Gcm);
        let tx = KeySlot::new(&a)
            .unwrap()
            .with_pid_xmit(PacketIdXmit::starting_at(u32::MAX));
        let mut buf = vec![0u8; 64];
        assert_eq!(
            encrypt(1, &tx, b"x", &mut buf).unwrap_err(),
            DcoError::PacketIdExhausted
        );
    }
}
