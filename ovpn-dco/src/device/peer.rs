// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::bind::Bind;
use super::keepalive::{KeepaliveTimers, KeepaliveVerdict};
use super::transport::PeerTransport;
use crate::crypto::CryptoState;
use crate::Instant;

/// Why a peer left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    Teardown,
    Userspace,
    Expired,
    TransportError,
    TransportDisconnect,
}

impl std::fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeleteReason::Teardown => "teardown",
            DeleteReason::Userspace => "userspace",
            DeleteReason::Expired => "expired",
            DeleteReason::TransportError => "transport-error",
            DeleteReason::TransportDisconnect => "transport-disconnect",
        };
        f.write_str(name)
    }
}

/// Addresses a peer owns inside the tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VpnAddrs {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl VpnAddrs {
    pub fn iter(&self) -> impl Iterator<Item = IpAddr> {
        self.ipv4
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.ipv6.map(IpAddr::V6))
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(a) => self.ipv4 == Some(a),
            IpAddr::V6(a) => self.ipv6 == Some(a),
        }
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    rx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    tx_bytes: AtomicU64,
    tx_packets: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

impl Counters {
    pub fn add_rx(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tx(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
        }
    }
}

/// Tunnel layer (inner packets) and transport layer (wire packets) counters.
#[derive(Debug, Default)]
pub struct PeerStats {
    pub vpn: Counters,
    pub link: Counters,
}

#[derive(Debug)]
pub struct Peer {
    id: u32,
    // Only written under the registry lock
    vpn_addrs: RwLock<VpnAddrs>,
    bind: RwLock<Option<Arc<Bind>>>,
    crypto: CryptoState,
    stats: PeerStats,
    keepalive: Mutex<KeepaliveTimers>,
    transport: PeerTransport,
    delete_reason: Mutex<Option<DeleteReason>>,
}

impl Peer {
    pub fn new(
        id: u32,
        vpn_addrs: VpnAddrs,
        bind: Option<Bind>,
        transport: PeerTransport,
        now: Instant,
    ) -> Peer {
        Peer {
            id,
            vpn_addrs: RwLock::new(vpn_addrs),
            bind: RwLock::new(bind.map(Arc::new)),
            crypto: CryptoState::default(),
            stats: PeerStats::default(),
            keepalive: Mutex::new(KeepaliveTimers::new(now)),
            transport,
            delete_reason: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn vpn_addrs(&self) -> VpnAddrs {
        *self.vpn_addrs.read()
    }

    pub(super) fn set_vpn_addrs(&self, addrs: VpnAddrs) {
        *self.vpn_addrs.write() = addrs;
    }

    /// Current binding. The returned `Arc` stays valid even if the peer
    /// floats while the caller is still using it.
    pub fn bind(&self) -> Option<Arc<Bind>> {
        self.bind.read().clone()
    }

    pub fn set_bind(&self, bind: Bind) {
        *self.bind.write() = Some(Arc::new(bind));
    }

    pub fn bind_matches(&self, remote: &SocketAddr) -> bool {
        self.bind
            .read()
            .as_ref()
            .map_or(false, |b| b.remote == *remote)
    }

    /// Move the peer to `remote`. Returns false if it already was there.
    pub fn float(&self, remote: SocketAddr) -> bool {
        let mut bind = self.bind.write();
        let new_bind = match bind.as_deref() {
            Some(old) if old.remote == remote => return false,
            Some(old) => old.floated(remote),
            None => Bind::new(remote, None),
        };
        *bind = Some(Arc::new(new_bind));
        true
    }

    /// Record the local address traffic from this peer arrives on.
    pub fn learn_local(&self, local: IpAddr) -> bool {
        let mut bind = self.bind.write();
        let learned = match bind.as_deref().and_then(|b| b.with_local(local)) {
            Some(learned) => learned,
            None => return false,
        };
        *bind = Some(Arc::new(learned));
        true
    }

    pub fn crypto(&self) -> &CryptoState {
        &self.crypto
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    pub fn transport(&self) -> &PeerTransport {
        &self.transport
    }

    pub fn set_keepalive(&self, interval: Duration, timeout: Duration, now: Instant) {
        self.keepalive.lock().set(interval, timeout, now);
    }

    /// `(interval, timeout)`
    pub fn keepalive_config(&self) -> (Duration, Duration) {
        let ka = self.keepalive.lock();
        (ka.interval(), ka.timeout())
    }

    pub fn keepalive_xmit_reset(&self, now: Instant) {
        self.keepalive.lock().xmit_reset(now);
    }

    pub fn keepalive_recv_reset(&self, now: Instant) {
        self.keepalive.lock().recv_reset(now);
    }

    pub fn keepalive_check(&self, now: Instant) -> KeepaliveVerdict {
        self.keepalive.lock().check(now)
    }

    pub fn last_recv(&self) -> Instant {
        self.keepalive.lock().last_recv()
    }

    pub fn last_sent(&self) -> Instant {
        self.keepalive.lock().last_sent()
    }

    /// First reason wins.
    pub(super) fn set_delete_reason(&self, reason: DeleteReason) {
        self.delete_reason.lock().get_or_insert(reason);
    }

    pub fn delete_reason(&self) -> Option<DeleteReason> {
        *self.delete_reason.lock()
    }
}
