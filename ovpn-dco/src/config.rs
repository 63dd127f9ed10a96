// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Provisioning file: peers, their keys and keepalive, and the networks
//! routed through them, applied at start-up through the control-plane entry
//! points of [`Device`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use ip_network::IpNetwork;
use serde::Deserialize;

use crate::crypto::{KeyConfig, KeyDirection, KeySlot, KeySlotPosition};
use crate::device::route::RouteTable;
use crate::device::{Device, Error, Mode, PeerConfig, VpnAddrs};
use crate::serialization::{KeyBytes, NonceTail};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningConfig {
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub id: u32,
    pub remote: Option<SocketAddr>,
    pub local_ip: Option<IpAddr>,
    pub vpn_ipv4: Option<Ipv4Addr>,
    pub vpn_ipv6: Option<Ipv6Addr>,
    /// Seconds, 0 disables keepalive
    #[serde(default)]
    pub keepalive_interval: u64,
    #[serde(default)]
    pub keepalive_timeout: u64,
    #[serde(default)]
    pub keys: Vec<KeyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyEntry {
    #[serde(default = "default_slot")]
    pub slot: String,
    pub key_id: u8,
    pub cipher: String,
    pub encrypt_key: String,
    pub encrypt_nonce_tail: String,
    pub decrypt_key: String,
    pub decrypt_nonce_tail: String,
}

fn default_slot() -> String {
    "primary".to_owned()
}

/// `network` is reached through the peer owning VPN address `via`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteEntry {
    pub network: String,
    pub via: IpAddr,
}

impl ProvisioningConfig {
    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Create every peer, install its keys and start its keepalive. A peer
    /// is only created once all of its keys were found valid.
    pub fn apply(&self, device: &Device, routes: &RouteTable) -> Result<(), Error> {
        if !self.routes.is_empty() && device.mode() == Mode::P2P {
            return Err(Error::WrongMode("routes"));
        }

        for entry in &self.peers {
            let keys = entry
                .keys
                .iter()
                .map(KeyEntry::to_key_config)
                .collect::<Result<Vec<_>, _>>()?;
            for (_, key) in &keys {
                KeySlot::new(key)?;
            }

            device.create_peer(PeerConfig {
                id: entry.id,
                remote: entry.remote,
                local_ip: entry.local_ip,
                vpn_addrs: VpnAddrs {
                    ipv4: entry.vpn_ipv4,
                    ipv6: entry.vpn_ipv6,
                },
                stream: None,
            })?;
            for (position, key) in &keys {
                device.install_key(entry.id, *position, key)?;
            }
            if entry.keepalive_interval > 0 && entry.keepalive_timeout > 0 {
                device.set_keepalive(
                    entry.id,
                    Duration::from_secs(entry.keepalive_interval),
                    Duration::from_secs(entry.keepalive_timeout),
                )?;
            }
        }

        for route in &self.routes {
            let network = route
                .network
                .parse::<IpNetwork>()
                .map_err(|e| Error::Config(format!("route {}: {}", route.network, e)))?;
            routes.add_route(network, route.via);
        }
        tracing::info!(
            message = "Provisioning applied",
            peers = self.peers.len(),
            routes = self.routes.len()
        );
        Ok(())
    }
}

impl KeyEntry {
    pub fn to_key_config(&self) -> Result<(KeySlotPosition, KeyConfig), Error> {
        let position = self.slot.parse()?;
        let key = KeyConfig {
            key_id: self.key_id,
            cipher: self.cipher.parse()?,
            encrypt: direction(&self.encrypt_key, &self.encrypt_nonce_tail)?,
            decrypt: direction(&self.decrypt_key, &self.decrypt_nonce_tail)?,
        };
        Ok((position, key))
    }
}

pub(crate) fn direction(key: &str, nonce_tail: &str) -> Result<KeyDirection, Error> {
    let KeyBytes(cipher_key) = key.parse().map_err(|e: &str| Error::Config(e.to_owned()))?;
    let NonceTail(nonce_tail) = nonce_tail
        .parse()
        .map_err(|e: &str| Error::Config(e.to_owned()))?;
    Ok(KeyDirection {
        cipher_key,
        nonce_tail,
    })
}
