// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Line-oriented control protocol.
//!
//! A request is either `get=1` or `set=1`, followed for `set` by
//! `key=value` lines and an empty line. Every request is answered with an
//! `errno=N` line (0 on success) and an empty line. Within `set`, a
//! `peer_id=` line opens a peer section that runs until the next
//! `peer_id=` or the end of the request; a `key_slot=` line inside it
//! opens a key section the same way.

use std::io::{self, BufRead, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use ip_network::IpNetwork;
use libc::{EAFNOSUPPORT, EEXIST, EINVAL, EIO, ENOENT, EOPNOTSUPP, EPROTO};

use super::route::RouteTable;
use super::transport::PeerTransport;
use super::{DeleteReason, Device, Error, Mode, PeerConfig, VpnAddrs};
use crate::config::KeyEntry;
use crate::crypto::{KeySlot, KeySlotPosition};
use crate::Instant;

/// Serve one request from `reader`. Returns `Ok(false)` once the other side
/// has hung up.
pub fn handle_request<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    device: &Device,
    routes: &RouteTable,
) -> io::Result<bool> {
    let mut cmd = String::new();
    loop {
        cmd.clear();
        if reader.read_line(&mut cmd)? == 0 {
            return Ok(false);
        }
        // Blank line closing a previous `get=1`
        if cmd != "\n" {
            break;
        }
    }
    let status = match cmd.trim_end_matches('\n') {
        "get=1" => api_get(writer, device, routes).map_or(EIO, |_| 0),
        "set=1" => api_set(reader, device, routes),
        _ => EIO,
    };
    writeln!(writer, "errno={}\n", status)?;
    writer.flush()?;
    Ok(true)
}

fn errno(err: &Error) -> i32 {
    match err {
        Error::AlreadyExists(_) => EEXIST,
        Error::PeerNotFound(_) => ENOENT,
        Error::InvalidAddressFamily(_) => EAFNOSUPPORT,
        Error::WrongMode(_) => EOPNOTSUPP,
        Error::InvalidPeerId(_)
        | Error::UnsupportedCipher(_)
        | Error::KeyMaterialSizeMismatch { .. }
        | Error::InvalidKeyId(_)
        | Error::Config(_) => EINVAL,
        Error::IoError(_)
        | Error::Socket(_)
        | Error::IfaceRead(_)
        | Error::ApiSocket(_)
        | Error::DropPrivileges(_) => EIO,
    }
}

fn api_get<W: Write>(writer: &mut W, device: &Device, routes: &RouteTable) -> io::Result<()> {
    let stats = device.stats();
    writeln!(writer, "mode={}", device.mode())?;
    writeln!(writer, "rx_dropped={}", stats.rx_dropped.load(std::sync::atomic::Ordering::Relaxed))?;
    writeln!(writer, "tx_dropped={}", stats.tx_dropped.load(std::sync::atomic::Ordering::Relaxed))?;

    for (network, via) in routes.routes() {
        writeln!(writer, "route={},{}", network, via)?;
    }

    let now = Instant::now();
    let mut peers = device.peers();
    peers.sort_by_key(|p| p.id());
    for peer in peers {
        writeln!(writer, "peer_id={}", peer.id())?;
        let transport = match peer.transport() {
            PeerTransport::Udp => "udp",
            PeerTransport::Tcp(_) => "tcp",
        };
        writeln!(writer, "transport={}", transport)?;

        if let Some(bind) = peer.bind() {
            writeln!(writer, "remote={}", bind.remote)?;
            if let Some(local) = bind.local {
                writeln!(writer, "local_ip={}", local)?;
            }
        }
        let vpn = peer.vpn_addrs();
        if let Some(ip) = vpn.ipv4 {
            writeln!(writer, "vpn_ipv4={}", ip)?;
        }
        if let Some(ip) = vpn.ipv6 {
            writeln!(writer, "vpn_ipv6={}", ip)?;
        }

        let (interval, timeout) = peer.keepalive_config();
        if !interval.is_zero() && !timeout.is_zero() {
            writeln!(writer, "keepalive_interval={}", interval.as_secs())?;
            writeln!(writer, "keepalive_timeout={}", timeout.as_secs())?;
        }
        writeln!(
            writer,
            "last_recv_sec={}",
            now.saturating_duration_since(peer.last_recv()).as_secs()
        )?;

        for (position, key_id, cipher, packet_id) in peer.crypto().describe() {
            writeln!(writer, "key={},{},{},{}", position, key_id, cipher, packet_id)?;
        }

        let vpn = peer.stats().vpn.snapshot();
        let link = peer.stats().link.snapshot();
        writeln!(writer, "vpn_rx_bytes={}", vpn.rx_bytes)?;
        writeln!(writer, "vpn_rx_packets={}", vpn.rx_packets)?;
        writeln!(writer, "vpn_tx_bytes={}", vpn.tx_bytes)?;
        writeln!(writer, "vpn_tx_packets={}", vpn.tx_packets)?;
        writeln!(writer, "link_rx_bytes={}", link.rx_bytes)?;
        writeln!(writer, "link_rx_packets={}", link.rx_packets)?;
        writeln!(writer, "link_tx_bytes={}", link.tx_bytes)?;
        writeln!(writer, "link_tx_packets={}", link.tx_packets)?;
    }
    Ok(())
}

fn api_set<R: BufRead>(reader: &mut R, device: &Device, routes: &RouteTable) -> i32 {
    let mut section: Option<PeerUpdate> = None;
    let mut status = 0;
    let mut cmd = String::new();

    loop {
        cmd.clear();
        match reader.read_line(&mut cmd) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => return EIO,
        }
        let line = cmd.trim_end_matches('\n');
        if line.is_empty() {
            break;
        }
        // Once a line failed the rest of the request is read but ignored
        if status == 0 {
            status = set_line(device, routes, &mut section, line);
        }
    }

    if status != 0 {
        return status;
    }
    match section.map(|done| done.commit(device)) {
        Some(Err(e)) => errno(&e),
        _ => 0,
    }
}

fn set_line(
    device: &Device,
    routes: &RouteTable,
    section: &mut Option<PeerUpdate>,
    line: &str,
) -> i32 {
    let (option, value) = match line.split_once('=') {
        Some(pair) => pair,
        None => return EPROTO,
    };

    if option == "peer_id" {
        if let Some(done) = section.take() {
            if let Err(e) = done.commit(device) {
                return errno(&e);
            }
        }
        return match value.parse::<u32>() {
            Ok(id) => {
                *section = Some(PeerUpdate::new(id));
                0
            }
            Err(_) => EINVAL,
        };
    }

    match section.as_mut() {
        Some(peer) => peer.set(option, value),
        None => set_device(device, routes, option, value),
    }
}

fn set_device(device: &Device, routes: &RouteTable, option: &str, value: &str) -> i32 {
    match option {
        "replace_peers" => match value.parse::<bool>() {
            Ok(true) => {
                for peer in device.peers() {
                    // Already gone is fine
                    let _ = device.delete_peer(peer.id(), DeleteReason::Userspace);
                }
                0
            }
            Ok(false) => 0,
            Err(_) => EINVAL,
        },
        "route" | "remove_route" if device.mode() == Mode::P2P => EOPNOTSUPP,
        "route" => {
            let (network, via) = match value.split_once(',') {
                Some(pair) => pair,
                None => return EPROTO,
            };
            match (network.parse::<IpNetwork>(), via.parse::<IpAddr>()) {
                (Ok(network), Ok(via)) => {
                    routes.add_route(network, via);
                    0
                }
                _ => EINVAL,
            }
        }
        "remove_route" => match value.parse::<IpNetwork>() {
            Ok(network) => match routes.remove_route(network) {
                Some(_) => 0,
                None => ENOENT,
            },
            Err(_) => EINVAL,
        },
        _ => EINVAL,
    }
}

/// Everything a peer section asked for, applied at the end of the section.
struct PeerUpdate {
    id: u32,
    remove: bool,
    remote: Option<SocketAddr>,
    local_ip: Option<IpAddr>,
    vpn_ipv4: Option<Ipv4Addr>,
    vpn_ipv6: Option<Ipv6Addr>,
    keepalive_interval: Option<u64>,
    keepalive_timeout: Option<u64>,
    keys: Vec<KeyEntry>,
    delete_key: Option<KeySlotPosition>,
    swap_keys: bool,
}

impl PeerUpdate {
    fn new(id: u32) -> Self {
        PeerUpdate {
            id,
            remove: false,
            remote: None,
            local_ip: None,
            vpn_ipv4: None,
            vpn_ipv6: None,
            keepalive_interval: None,
            keepalive_timeout: None,
            keys: vec![],
            delete_key: None,
            swap_keys: false,
        }
    }

    fn set(&mut self, option: &str, value: &str) -> i32 {
        fn parse<T: std::str::FromStr>(value: &str, field: &mut Option<T>) -> i32 {
            match value.parse() {
                Ok(v) => {
                    *field = Some(v);
                    0
                }
                Err(_) => EINVAL,
            }
        }

        match option {
            "remove" => match value.parse::<bool>() {
                Ok(remove) => {
                    self.remove = remove;
                    0
                }
                Err(_) => EINVAL,
            },
            "remote" => parse(value, &mut self.remote),
            "local_ip" => parse(value, &mut self.local_ip),
            "vpn_ipv4" => parse(value, &mut self.vpn_ipv4),
            "vpn_ipv6" => parse(value, &mut self.vpn_ipv6),
            "keepalive_interval" => parse(value, &mut self.keepalive_interval),
            "keepalive_timeout" => parse(value, &mut self.keepalive_timeout),
            "delete_key" => parse(value, &mut self.delete_key),
            "swap_keys" => match value.parse::<bool>() {
                Ok(swap) => {
                    self.swap_keys = swap;
                    0
                }
                Err(_) => EINVAL,
            },
            "key_slot" => {
                self.keys.push(KeyEntry {
                    slot: value.to_owned(),
                    key_id: 0,
                    cipher: String::new(),
                    encrypt_key: String::new(),
                    encrypt_nonce_tail: String::new(),
                    decrypt_key: String::new(),
                    decrypt_nonce_tail: String::new(),
                });
                0
            }
            _ => match self.keys.last_mut() {
                Some(key) => set_key(key, option, value),
                None => EINVAL,
            },
        }
    }

    fn commit(self, device: &Device) -> Result<(), Error> {
        if self.remove {
            return device.delete_peer(self.id, DeleteReason::Userspace);
        }

        let keys = self
            .keys
            .iter()
            .map(KeyEntry::to_key_config)
            .collect::<Result<Vec<_>, _>>()?;
        for (_, key) in &keys {
            KeySlot::new(key)?;
        }

        match device.registry().lookup_by_id(self.id) {
            None => device.create_peer(PeerConfig {
                id: self.id,
                remote: self.remote,
                local_ip: self.local_ip,
                vpn_addrs: VpnAddrs {
                    ipv4: self.vpn_ipv4,
                    ipv6: self.vpn_ipv6,
                },
                stream: None,
            })?,
            Some(peer) => {
                if let Some(remote) = self.remote {
                    device.set_peer_binding(self.id, remote, self.local_ip)?;
                }
                if self.vpn_ipv4.is_some() || self.vpn_ipv6.is_some() {
                    let current = peer.vpn_addrs();
                    let addrs = VpnAddrs {
                        ipv4: self.vpn_ipv4.or(current.ipv4),
                        ipv6: self.vpn_ipv6.or(current.ipv6),
                    };
                    device.set_peer_vpn_addrs(self.id, addrs)?;
                }
            }
        }

        for (position, key) in &keys {
            device.install_key(self.id, *position, key)?;
        }
        if let Some(position) = self.delete_key {
            device.delete_key(self.id, position)?;
        }
        if self.swap_keys {
            device.swap_keys(self.id)?;
        }
        if let (Some(interval), Some(timeout)) = (self.keepalive_interval, self.keepalive_timeout) {
            device.set_keepalive(
                self.id,
                Duration::from_secs(interval),
                Duration::from_secs(timeout),
            )?;
        }
        Ok(())
    }
}

fn set_key(key: &mut KeyEntry, option: &str, value: &str) -> i32 {
    let field = match option {
        "key_id" => {
            return match value.parse::<u8>() {
                Ok(id) => {
                    key.key_id = id;
                    0
                }
                Err(_) => EINVAL,
            }
        }
        "cipher" => &mut key.cipher,
        "encrypt_key" => &mut key.encrypt_key,
        "encrypt_nonce_tail" => &mut key.encrypt_nonce_tail,
        "decrypt_key" => &mut key.decrypt_key,
        "decrypt_nonce_tail" => &mut key.decrypt_nonce_tail,
        _ => return EINVAL,
    };
    *field = value.to_owned();
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::integration_tests::mocks::TestBed;

    const KEY_256: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    fn request(bed: &TestBed, text: &str) -> String {
        let mut reader = io::Cursor::new(text.as_bytes().to_vec());
        let mut out = vec![];
        assert!(handle_request(&mut reader, &mut out, &bed.device, &bed.routes).unwrap());
        String::from_utf8(out).unwrap()
    }

    fn create_peer_request(id: u32, vpn: &str) -> String {
        format!(
            "set=1\npeer_id={id}\nremote=192.0.2.{id}:1194\nvpn_ipv4={vpn}\n\
             keepalive_interval=10\nkeepalive_timeout=60\n\
             key_slot=primary\nkey_id=2\ncipher=aes-256-gcm\n\
             encrypt_key={KEY_256}\nencrypt_nonce_tail=0102030405060708\n\
             decrypt_key={KEY_256}\ndecrypt_nonce_tail=0807060504030201\n\n"
        )
    }

    #[test]
    fn set_then_get() {
        let bed = TestBed::new(Mode::MP);
        assert_eq!(request(&bed, &create_peer_request(4, "10.8.0.4")), "errno=0\n\n");
        assert_eq!(
            request(&bed, "set=1\nroute=192.168.7.0/24,10.8.0.4\n\n"),
            "errno=0\n\n"
        );

        let out = request(&bed, "get=1\n\n");
        assert!(out.starts_with("mode=mp\n"));
        for line in [
            "route=192.168.7.0/24,10.8.0.4",
            "peer_id=4",
            "transport=udp",
            "remote=192.0.2.4:1194",
            "vpn_ipv4=10.8.0.4",
            "keepalive_interval=10",
            "keepalive_timeout=60",
            "key=primary,2,aes-256-gcm,0",
            "link_tx_packets=0",
        ] {
            assert!(out.lines().any(|l| l == line), "missing {}", line);
        }
        assert!(out.ends_with("errno=0\n\n"));
    }

    #[test]
    fn update_existing_peer() {
        let bed = TestBed::new(Mode::MP);
        request(&bed, &create_peer_request(1, "10.8.0.2"));
        let out = request(
            &bed,
            "set=1\npeer_id=1\nremote=192.0.2.99:1194\nvpn_ipv6=fd00::2\n\n",
        );
        assert_eq!(out, "errno=0\n\n");

        let peer = bed.device.registry().lookup_by_id(1).unwrap();
        assert_eq!(peer.bind().unwrap().remote, "192.0.2.99:1194".parse().unwrap());
        assert_eq!(peer.vpn_addrs().ipv4, Some("10.8.0.2".parse().unwrap()));
        assert_eq!(peer.vpn_addrs().ipv6, Some("fd00::2".parse().unwrap()));
    }

    #[test]
    fn key_rotation_commands() {
        let bed = TestBed::new(Mode::MP);
        request(&bed, &create_peer_request(1, "10.8.0.2"));
        let rotate = format!(
            "set=1\npeer_id=1\nkey_slot=secondary\nkey_id=3\ncipher=chacha20-poly1305\n\
             encrypt_key={KEY_256}\nencrypt_nonce_tail=0102030405060708\n\
             decrypt_key={KEY_256}\ndecrypt_nonce_tail=0807060504030201\nswap_keys=true\n\n"
        );
        assert_eq!(request(&bed, &rotate), "errno=0\n\n");
        let peer = bed.device.registry().lookup_by_id(1).unwrap();
        assert_eq!(peer.crypto().primary().unwrap().key_id(), 3);

        assert_eq!(
            request(&bed, "set=1\npeer_id=1\ndelete_key=secondary\n\n"),
            "errno=0\n\n"
        );
        assert_eq!(peer.crypto().describe().len(), 1);
    }

    #[test]
    fn remove_and_replace_peers() {
        let bed = TestBed::new(Mode::MP);
        request(&bed, &create_peer_request(1, "10.8.0.2"));
        request(&bed, &create_peer_request(2, "10.8.0.3"));

        assert_eq!(request(&bed, "set=1\npeer_id=1\nremove=true\n\n"), "errno=0\n\n");
        assert_eq!(bed.deleted(), vec![(1, DeleteReason::Userspace)]);
        assert_eq!(
            request(&bed, "set=1\npeer_id=1\nremove=true\n\n"),
            format!("errno={}\n\n", ENOENT)
        );

        assert_eq!(request(&bed, "set=1\nreplace_peers=true\n\n"), "errno=0\n\n");
        assert!(bed.device.registry().is_empty());
    }

    #[test]
    fn bad_requests() {
        let bed = TestBed::new(Mode::MP);
        let status = |text: &str| request(&bed, text);

        assert_eq!(status("frobnicate=1\n"), format!("errno={}\n\n", EIO));
        assert_eq!(status("set=1\nno equals sign\n\n"), format!("errno={}\n\n", EPROTO));
        assert_eq!(status("set=1\nbogus=1\n\n"), format!("errno={}\n\n", EINVAL));
        assert_eq!(
            status("set=1\npeer_id=1\nremote=nowhere\n\n"),
            format!("errno={}\n\n", EINVAL)
        );

        // Wrong key size: the peer is not created
        let short_key = create_peer_request(1, "10.8.0.2").replace("aes-256-gcm", "aes-128-gcm");
        assert_eq!(status(&short_key), format!("errno={}\n\n", EINVAL));
        assert!(bed.device.registry().is_empty());
    }

    #[test]
    fn failed_set_consumes_whole_request() {
        let bed = TestBed::new(Mode::MP);
        let mut reader = io::Cursor::new(
            b"set=1\nbogus=1\npeer_id=5\nremote=192.0.2.5:1194\n\nget=1\n\n".to_vec(),
        );
        let mut out = vec![];

        assert!(handle_request(&mut reader, &mut out, &bed.device, &bed.routes).unwrap());
        assert_eq!(String::from_utf8(out).unwrap(), format!("errno={}\n\n", EINVAL));
        assert!(bed.device.registry().is_empty());

        // The next request starts right after the blank line
        let mut out = vec![];
        assert!(handle_request(&mut reader, &mut out, &bed.device, &bed.routes).unwrap());
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("mode=mp\n"));
        assert!(out.ends_with("errno=0\n\n"));

        let mut out = vec![];
        assert!(!handle_request(&mut reader, &mut out, &bed.device, &bed.routes).unwrap());
        assert!(out.is_empty());
    }

    #[test]
    fn routes_need_multipeer() {
        let bed = TestBed::new(Mode::P2P);
        assert_eq!(
            request(&bed, "set=1\nroute=192.168.7.0/24,10.8.0.4\n\n"),
            format!("errno={}\n\n", EOPNOTSUPP)
        );
    }

    #[test]
    fn hang_up() {
        let bed = TestBed::new(Mode::MP);
        let mut reader = io::Cursor::new(Vec::new());
        let mut out = vec![];
        assert!(!handle_request(&mut reader, &mut out, &bed.device, &bed.routes).unwrap());
        assert!(out.is_empty());
    }
}
