// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! OpenVPN data channel framing.
//!
//! A DATA_V2 packet on the wire:
//!
//! ```text
//! 48000001 00000005 [ ciphertext ... ] [ 16-byte auth tag ]
//! [ OP32 ] [pkt id]
//! ```
//!
//! The first byte packs a 5-bit opcode with a 3-bit key id, the next three
//! bytes carry the 24-bit peer id. The packet id doubles as the head of the
//! 12-byte AEAD nonce, the 8-byte nonce tail is never sent.

use std::convert::TryInto;
use std::net::IpAddr;

use crate::errors::DcoError;

pub const KEY_ID_MASK: u8 = 0x07;
pub const OPCODE_SHIFT: u8 = 3;
pub const OPCODE_MASK: u8 = 0x1F;
/// Number of distinct key ids a peer can have on the wire.
pub const KEY_ID_MAX: u8 = KEY_ID_MASK + 1;

pub const DATA_V1: u8 = 6;
pub const DATA_V2: u8 = 9;

pub const OP_SIZE_V2: usize = 4;
pub const PACKET_ID_SIZE: usize = 4;
pub const NONCE_TAIL_SIZE: usize = 8;
pub const NONCE_SIZE: usize = PACKET_ID_SIZE + NONCE_TAIL_SIZE;
pub const AUTH_TAG_SIZE: usize = 16;

/// Bytes in front of the ciphertext, also the AEAD associated data.
pub const DATA_HEADER_SIZE: usize = OP_SIZE_V2 + PACKET_ID_SIZE;
/// Total growth of a payload when it is sealed.
pub const DATA_OVERHEAD_SZ: usize = DATA_HEADER_SIZE + AUTH_TAG_SIZE;

pub const PEER_ID_MASK: u32 = 0x00FF_FFFF;
/// Peer id value meaning "not assigned", the sender must then be found by
/// its transport address.
pub const PEER_ID_UNDEF: u32 = 0x00FF_FFFF;

/// Length of the prefix in front of every unit on a TCP stream.
pub const TCP_LEN_PREFIX_SZ: usize = 2;

pub const KEEPALIVE_SIZE: usize = 16;
/// Payload of an OpenVPN ping.
pub const KEEPALIVE_MESSAGE: [u8; KEEPALIVE_SIZE] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7, 0x48,
];

const IPV4_MIN_HEADER_SIZE: usize = 20;
const IPV4_SRC_IP_OFF: usize = 12;
const IPV4_DST_IP_OFF: usize = 16;
const IPV4_IP_SZ: usize = 4;

const IPV6_MIN_HEADER_SIZE: usize = 40;
const IPV6_SRC_IP_OFF: usize = 8;
const IPV6_DST_IP_OFF: usize = 24;
const IPV6_IP_SZ: usize = 16;

/// Build the 32-bit op field: opcode and key id in the top byte, peer id
/// in the lower 24 bits.
pub fn opcode_compose(opcode: u8, key_id: u8, peer_id: u32) -> u32 {
    let op8 = ((opcode & OPCODE_MASK) << OPCODE_SHIFT) | (key_id & KEY_ID_MASK);
    ((op8 as u32) << 24) | (peer_id & PEER_ID_MASK)
}

/// Opcode of a transport packet, `None` when the packet is empty.
pub fn opcode_from_packet(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> OPCODE_SHIFT)
}

pub fn key_id_from_packet(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b & KEY_ID_MASK)
}

/// Peer id of a DATA_V2 packet. Requires the full 4-byte op field.
pub fn peer_id_from_packet(packet: &[u8]) -> Option<u32> {
    let op: [u8; OP_SIZE_V2] = packet.get(..OP_SIZE_V2)?.try_into().ok()?;
    Some(u32::from_be_bytes(op) & PEER_ID_MASK)
}

/// Parsed view over the cleartext part of a DATA_V2 packet.
#[derive(Debug)]
pub struct DataHeader<'a> {
    pub opcode: u8,
    pub key_id: u8,
    pub peer_id: u32,
    pub packet_id: u32,
    /// The op field and packet id, authenticated as associated data.
    pub aad: &'a [u8],
}

impl<'a> DataHeader<'a> {
    pub fn parse(packet: &'a [u8]) -> Result<DataHeader<'a>, DcoError> {
        if packet.len() < DATA_OVERHEAD_SZ {
            return Err(DcoError::MalformedHeader);
        }

        let op = u32::from_be_bytes(
            packet[..OP_SIZE_V2]
                .try_into()
                .map_err(|_| DcoError::MalformedHeader)?,
        );
        let packet_id = u32::from_be_bytes(
            packet[OP_SIZE_V2..DATA_HEADER_SIZE]
                .try_into()
                .map_err(|_| DcoError::MalformedHeader)?,
        );
        let op8 = (op >> 24) as u8;
        let opcode = op8 >> OPCODE_SHIFT;
        if opcode != DATA_V2 {
            return Err(DcoError::MalformedHeader);
        }

        Ok(DataHeader {
            opcode,
            key_id: op8 & KEY_ID_MASK,
            peer_id: op & PEER_ID_MASK,
            packet_id,
            aad: &packet[..DATA_HEADER_SIZE],
        })
    }
}

/// Full AEAD nonce: packet id (big endian) followed by the nonce tail.
pub fn nonce_compose(packet_id: u32, tail: &[u8; NONCE_TAIL_SIZE]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..PACKET_ID_SIZE].copy_from_slice(&packet_id.to_be_bytes());
    nonce[PACKET_ID_SIZE..].copy_from_slice(tail);
    nonce
}

/// Length of the next unit on a TCP stream, including the prefix.
///
/// `Ok(None)` means more bytes are needed. A length below 2 cannot carry an
/// opcode and breaks the stream.
pub fn tcp_frame_len(stream: &[u8]) -> Result<Option<usize>, DcoError> {
    if stream.len() < TCP_LEN_PREFIX_SZ {
        return Ok(None);
    }
    let len = u16::from_be_bytes([stream[0], stream[1]]) as usize;
    if len < 2 {
        return Err(DcoError::MalformedHeader);
    }
    Ok(Some(len + TCP_LEN_PREFIX_SZ))
}

/// Prepend the 2-byte length prefix to a unit.
pub fn tcp_frame(unit: &[u8]) -> Result<Vec<u8>, DcoError> {
    let len: u16 = unit
        .len()
        .try_into()
        .map_err(|_| DcoError::InsufficientHeadroom)?;
    let mut framed = Vec::with_capacity(unit.len() + TCP_LEN_PREFIX_SZ);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(unit);
    Ok(framed)
}

/// IP version of an inner packet, checking the minimum header size.
pub fn ip_version(packet: &[u8]) -> Option<u8> {
    match packet.first()? >> 4 {
        4 if packet.len() >= IPV4_MIN_HEADER_SIZE => Some(4),
        6 if packet.len() >= IPV6_MIN_HEADER_SIZE => Some(6),
        _ => None,
    }
}

pub fn dst_address(packet: &[u8]) -> Option<IpAddr> {
    match ip_version(packet)? {
        4 => {
            let addr_bytes: [u8; IPV4_IP_SZ] = packet
                [IPV4_DST_IP_OFF..IPV4_DST_IP_OFF + IPV4_IP_SZ]
                .try_into()
                .ok()?;
            Some(IpAddr::from(addr_bytes))
        }
        _ => {
            let addr_bytes: [u8; IPV6_IP_SZ] = packet
                [IPV6_DST_IP_OFF..IPV6_DST_IP_OFF + IPV6_IP_SZ]
                .try_into()
                .ok()?;
            Some(IpAddr::from(addr_bytes))
        }
    }
}

pub fn src_address(packet: &[u8]) -> Option<IpAddr> {
    match ip_version(packet)? {
        4 => {
            let addr_bytes: [u8; IPV4_IP_SZ] = packet
                [IPV4_SRC_IP_OFF..IPV4_SRC_IP_OFF + IPV4_IP_SZ]
                .try_into()
                .ok()?;
            Some(IpAddr::from(addr_bytes))
        }
        _ => {
            let addr_bytes: [u8; IPV6_IP_SZ] = packet
                [IPV6_SRC_IP_OFF..IPV6_SRC_IP_OFF + IPV6_IP_SZ]
                .try_into()
                .ok()?;
            Some(IpAddr::from(addr_bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn op_field_layout() {
        let op = opcode_compose(DATA_V2, 5, 0x123456);
        let bytes = op.to_be_bytes();
        assert_eq!(bytes, [0x4d, 0x12, 0x34, 0x56]);
        assert_eq!(opcode_from_packet(&bytes), Some(DATA_V2));
        assert_eq!(key_id_from_packet(&bytes), Some(5));
        assert_eq!(peer_id_from_packet(&bytes), Some(0x123456));
    }

    #[test]
    fn peer_id_is_truncated_to_24_bits() {
        let op = opcode_compose(DATA_V2, 0, 0xAB00_0001);
        assert_eq!(peer_id_from_packet(&op.to_be_bytes()), Some(1));
    }

    #[test]
    fn short_packets_are_malformed() {
        assert!(peer_id_from_packet(&[0x48, 0, 0]).is_none());
        assert_eq!(opcode_from_packet(&[]), None);
        let short = [0x48u8; DATA_OVERHEAD_SZ - 1];
        assert_eq!(
            DataHeader::parse(&short).unwrap_err(),
            DcoError::MalformedHeader
        );
    }

    #[test]
    fn header_parse() {
        let mut packet = opcode_compose(DATA_V2, 2, 77).to_be_bytes().to_vec();
        packet.extend_from_slice(&9u32.to_be_bytes());
        packet.extend_from_slice(&[0u8; AUTH_TAG_SIZE]);
        let header = DataHeader::parse(&packet).unwrap();
        assert_eq!(header.key_id, 2);
        assert_eq!(header.peer_id, 77);
        assert_eq!(header.packet_id, 9);
        assert_eq!(header.aad, &packet[..DATA_HEADER_SIZE]);
    }

    #[test]
    fn control_opcode_is_not_data() {
        let mut packet = opcode_compose(7, 0, 1).to_be_bytes().to_vec();
        packet.resize(64, 0);
        assert!(DataHeader::parse(&packet).is_err());
    }

    #[test]
    fn nonce_layout() {
        let nonce = nonce_compose(5, &[0x52, 0x1c, 0x3b, 0x01, 0x43, 0x08, 0xc0, 0x41]);
        assert_eq!(
            nonce,
            [0, 0, 0, 5, 0x52, 0x1c, 0x3b, 0x01, 0x43, 0x08, 0xc0, 0x41]
        );
    }

    #[test]
    fn tcp_framing() {
        assert_eq!(tcp_frame_len(&[0]), Ok(None));
        assert_eq!(tcp_frame_len(&[0, 1]), Err(DcoError::MalformedHeader));
        assert_eq!(tcp_frame_len(&[0, 10, 1, 2]), Ok(Some(12)));
        let framed = tcp_frame(&[1, 2, 3]).unwrap();
        assert_eq!(framed, vec![0, 3, 1, 2, 3]);
        assert_eq!(
            tcp_frame(&vec![0u8; 70_000]).unwrap_err(),
            DcoError::InsufficientHeadroom
        );
    }

    #[test]
    fn inner_addresses() {
        let header = etherparse::PacketBuilder::ipv4([10, 8, 0, 2], [10, 8, 0, 1], 5).udp(1, 2);
        let mut packet = Vec::new();
        header.write(&mut packet, &[1, 2, 3]).unwrap();
        assert_eq!(ip_version(&packet), Some(4));
        assert_eq!(src_address(&packet), Some(IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2))));
        assert_eq!(dst_address(&packet), Some(IpAddr::V4(Ipv4Addr::new(10, 8, 0, 1))));
        assert_eq!(ip_version(&KEEPALIVE_MESSAGE), None);
    }
}
