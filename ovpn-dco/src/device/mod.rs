// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

pub mod api;
pub mod bind;
#[cfg(unix)]
pub mod drop_privileges;
#[cfg(all(unix, feature = "device"))]
pub mod handle;
pub mod keepalive;
pub mod peer;
pub mod ratelimit;
pub mod registry;
pub mod route;
pub mod transport;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bind::Bind;
#[cfg(all(unix, feature = "device"))]
pub use handle::DeviceHandle;
use keepalive::{earliest, KeepaliveVerdict, KeepaliveWorker};
pub use peer::{DeleteReason, Peer, VpnAddrs};
use ratelimit::LogRateLimiter;
use registry::PeerRegistry;
use route::Router;
use transport::{DatagramTransport, PeerTransport, StreamTransport, TcpLink};

use crate::crypto::{aead, KeyConfig, KeySlot, KeySlotPosition};
use crate::errors::DcoError;
use crate::proto::{
    self, DATA_OVERHEAD_SZ, DATA_V2, KEEPALIVE_MESSAGE, PEER_ID_MASK, PEER_ID_UNDEF,
    TCP_LEN_PREFIX_SZ,
};
use crate::Instant;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("peer {0} already exists")]
    AlreadyExists(u32),
    #[error("peer {0} not found")]
    PeerNotFound(u32),
    #[error("invalid peer id {0}")]
    InvalidPeerId(u32),
    #[error("address family of {0} is not supported")]
    InvalidAddressFamily(SocketAddr),
    #[error("unsupported cipher {0}")]
    UnsupportedCipher(String),
    #[error("key material is {got} bytes, cipher needs {expected}")]
    KeyMaterialSizeMismatch { expected: usize, got: usize },
    #[error("invalid key id {0}")]
    InvalidKeyId(u8),
    #[error("{0} is not available in this mode")]
    WrongMode(&'static str),
    #[error("i/o error: {0}")]
    IoError(#[from] io::Error),
    #[error("{0}")]
    Socket(io::Error),
    #[error("interface: {0}")]
    IfaceRead(io::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("API socket error: {0}")]
    ApiSocket(io::Error),
    #[error("{0}")]
    DropPrivileges(String),
}

/// Point-to-point devices have exactly one peer that gets all traffic;
/// multi-peer devices pick the peer by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    P2P,
    MP,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p2p" => Ok(Mode::P2P),
            "mp" => Ok(Mode::MP),
            _ => Err(Error::Config(format!("unknown mode {}", s))),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::P2P => f.write_str("p2p"),
            Mode::MP => f.write_str("mp"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub mode: Mode,
    pub n_threads: usize,
    pub listen_port: u16,
    pub use_ipv6: bool,
    /// Already-open tunnel device handed over by the parent process, -1 to
    /// create one named after the interface.
    pub tun_fd: i32,
    /// Control connection handed over by the parent process, -1 for a
    /// socket under the run directory.
    pub uapi_fd: i32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            mode: Mode::P2P,
            n_threads: 4,
            listen_port: 1194,
            use_ipv6: true,
            tun_fd: -1,
            uapi_fd: -1,
        }
    }
}

/// The virtual interface decrypted packets are delivered to.
pub trait Interface: Send + Sync {
    fn inject_plaintext(&self, packet: &[u8]);
}

/// The control plane process.
pub trait Userspace: Send + Sync {
    /// A non-data packet arrived; it is passed on untouched. TCP packets
    /// keep their length prefix.
    fn forward_control(&self, peer_id: Option<u32>, from: Option<SocketAddr>, packet: &[u8]);

    /// Called once per peer when it leaves the registry.
    fn peer_deleted(&self, peer_id: u32, reason: DeleteReason);
}

/// Everything needed to create a peer.
pub struct PeerConfig {
    pub id: u32,
    pub remote: Option<SocketAddr>,
    pub local_ip: Option<IpAddr>,
    pub vpn_addrs: VpnAddrs,
    /// Attach the peer to this stream instead of the device's UDP socket.
    pub stream: Option<Box<dyn StreamTransport>>,
}

impl PeerConfig {
    pub fn udp(id: u32, remote: SocketAddr, vpn_addrs: VpnAddrs) -> Self {
        PeerConfig {
            id,
            remote: Some(remote),
            local_ip: None,
            vpn_addrs,
            stream: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceStats {
    pub rx_dropped: AtomicU64,
    pub tx_dropped: AtomicU64,
}

pub struct Device {
    registry: PeerRegistry,
    udp: Arc<dyn DatagramTransport>,
    tun: Arc<dyn Interface>,
    userspace: Arc<dyn Userspace>,
    router: Arc<dyn Router>,
    keepalive: KeepaliveWorker,
    log_limit: LogRateLimiter,
    stats: DeviceStats,
}

impl Device {
    pub fn new(
        mode: Mode,
        udp: Arc<dyn DatagramTransport>,
        tun: Arc<dyn Interface>,
        userspace: Arc<dyn Userspace>,
        router: Arc<dyn Router>,
    ) -> Device {
        Device {
            registry: PeerRegistry::new(mode),
            udp,
            tun,
            userspace,
            router,
            keepalive: KeepaliveWorker::default(),
            log_limit: LogRateLimiter::default(),
            stats: DeviceStats::default(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.registry.mode()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn keepalive_worker(&self) -> &KeepaliveWorker {
        &self.keepalive
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.registry.snapshot()
    }

    fn peer(&self, peer_id: u32) -> Result<Arc<Peer>, Error> {
        self.registry
            .lookup_by_id(peer_id)
            .ok_or(Error::PeerNotFound(peer_id))
    }

    pub fn create_peer(&self, config: PeerConfig) -> Result<(), Error> {
        if config.id > PEER_ID_MASK || config.id == PEER_ID_UNDEF {
            return Err(Error::InvalidPeerId(config.id));
        }
        if let (Some(remote), None) = (&config.remote, &config.stream) {
            if !self.udp.supports(remote) {
                return Err(Error::InvalidAddressFamily(*remote));
            }
        }

        let transport = match config.stream {
            Some(stream) => PeerTransport::Tcp(TcpLink::new(stream)),
            None => PeerTransport::Udp,
        };
        let bind = config.remote.map(|r| Bind::new(r, config.local_ip));
        let peer = Arc::new(Peer::new(
            config.id,
            config.vpn_addrs,
            bind,
            transport,
            Instant::now(),
        ));

        if let Some(replaced) = self.registry.add(Arc::clone(&peer))? {
            self.release(&replaced, DeleteReason::Teardown);
        }
        tracing::info!(message = "Peer added", peer_id = config.id, transport = ?peer.transport());
        Ok(())
    }

    pub fn install_key(
        &self,
        peer_id: u32,
        position: KeySlotPosition,
        key: &KeyConfig,
    ) -> Result<(), Error> {
        let peer = self.peer(peer_id)?;
        let slot = KeySlot::new(key)?;
        peer.crypto().install(position, slot);
        tracing::debug!(
            message = "Key installed",
            peer_id,
            key_id = key.key_id,
            slot = %position,
            cipher = %key.cipher
        );
        Ok(())
    }

    pub fn swap_keys(&self, peer_id: u32) -> Result<(), Error> {
        self.peer(peer_id)?.crypto().swap();
        tracing::debug!(message = "Key slots swapped", peer_id);
        Ok(())
    }

    pub fn delete_key(&self, peer_id: u32, position: KeySlotPosition) -> Result<(), Error> {
        if self.peer(peer_id)?.crypto().delete(position) {
            tracing::debug!(message = "Key deleted", peer_id, slot = %position);
        }
        Ok(())
    }

    pub fn set_peer_binding(
        &self,
        peer_id: u32,
        remote: SocketAddr,
        local: Option<IpAddr>,
    ) -> Result<(), Error> {
        let peer = self.peer(peer_id)?;
        if !peer.transport().is_tcp() && !self.udp.supports(&remote) {
            return Err(Error::InvalidAddressFamily(remote));
        }
        peer.set_bind(Bind::new(remote, local));
        self.registry.rehash_transport(&peer);
        Ok(())
    }

    pub fn set_peer_vpn_addrs(&self, peer_id: u32, addrs: VpnAddrs) -> Result<(), Error> {
        let peer = self.peer(peer_id)?;
        self.registry.rehash_vpn(&peer, addrs);
        Ok(())
    }

    /// Zero for either value disables both timers.
    pub fn set_keepalive(
        &self,
        peer_id: u32,
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), Error> {
        let peer = self.peer(peer_id)?;
        peer.set_keepalive(interval, timeout, Instant::now());
        tracing::debug!(
            message = "Keepalive set",
            peer_id,
            interval = interval.as_secs(),
            timeout = timeout.as_secs()
        );
        self.keepalive.kick();
        Ok(())
    }

    pub fn delete_peer(&self, peer_id: u32, reason: DeleteReason) -> Result<(), Error> {
        let peer = self.peer(peer_id)?;
        self.delete(&peer, reason);
        Ok(())
    }

    /// Drop every peer and stop the keepalive worker.
    pub fn shutdown(&self) {
        self.keepalive.stop();
        for peer in self.registry.drain() {
            self.release(&peer, DeleteReason::Teardown);
        }
    }

    /// Unhash `peer`; only the call that actually unhashed it notifies.
    fn delete(&self, peer: &Arc<Peer>, reason: DeleteReason) -> bool {
        if !self.registry.remove(peer) {
            return false;
        }
        self.release(peer, reason);
        true
    }

    fn release(&self, peer: &Arc<Peer>, reason: DeleteReason) {
        peer.set_delete_reason(reason);
        tracing::info!(message = "Peer removed", peer_id = peer.id(), reason = %reason);
        self.userspace.peer_deleted(peer.id(), reason);
    }

    fn drop_rx(&self, peer_id: Option<u32>, err: DcoError) {
        self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
        if self.log_limit.allow() {
            tracing::debug!(message = "Dropped incoming packet", peer_id = ?peer_id, error = ?err);
        }
    }

    fn drop_tx(&self, peer_id: Option<u32>, err: DcoError) {
        self.stats.tx_dropped.fetch_add(1, Ordering::Relaxed);
        if self.log_limit.allow() {
            tracing::debug!(message = "Dropped outgoing packet", peer_id = ?peer_id, error = ?err);
        }
    }

    /// Entry point for packets the interface wants to send.
    pub fn accept_plaintext_for_transmit(&self, packet: &[u8]) {
        if proto::ip_version(packet).is_none() {
            return self.drop_tx(None, DcoError::UnsupportedProtocol);
        }
        self.send(packet, None)
    }

    /// Send `packet` to `peer`, or to the peer owning its destination.
    pub fn send(&self, packet: &[u8], peer: Option<Arc<Peer>>) {
        let peer = peer.or_else(|| {
            proto::dst_address(packet)
                .and_then(|dst| self.registry.get_by_dst(dst, self.router.as_ref()))
        });
        match peer {
            Some(peer) => self.encrypt_one(peer, packet),
            None => self.drop_tx(None, DcoError::NoPeer),
        }
    }

    fn encrypt_one(&self, peer: Arc<Peer>, packet: &[u8]) {
        let slot = match peer.crypto().primary() {
            Ok(slot) => slot,
            Err(e) => return self.drop_tx(Some(peer.id()), e),
        };

        let mut buf = vec![0u8; packet.len() + DATA_OVERHEAD_SZ];
        let result = aead::encrypt(peer.id(), &slot, packet, &mut buf).map(|wire| wire.len());
        let result = result.map(|len| {
            buf.truncate(len);
            buf
        });
        self.encrypt_post(peer, packet.len(), result)
    }

    /// Completion of an encryption, may run on any thread.
    pub fn encrypt_post(&self, peer: Arc<Peer>, orig_len: usize, result: Result<Vec<u8>, DcoError>) {
        let wire = match result {
            Ok(wire) => wire,
            Err(e) => return self.drop_tx(Some(peer.id()), e),
        };
        peer.stats().vpn.add_tx(orig_len);
        peer.stats().link.add_tx(wire.len());

        let sent = match peer.transport() {
            PeerTransport::Udp => match peer.bind() {
                Some(bind) => self.udp.send_datagram(&bind, &wire).map_err(|e| {
                    tracing::trace!(message = "UDP send failed", peer_id = peer.id(), error = ?e);
                    DcoError::TransportError
                }),
                None => Err(DcoError::NoBinding),
            },
            PeerTransport::Tcp(link) => link.send(&wire),
        };

        match sent {
            Ok(()) => peer.keepalive_xmit_reset(Instant::now()),
            Err(DcoError::TransportError) if peer.transport().is_tcp() => {
                self.drop_tx(Some(peer.id()), DcoError::TransportError);
                self.delete(&peer, DeleteReason::TransportError);
            }
            Err(e) => self.drop_tx(Some(peer.id()), e),
        }
    }

    /// A datagram arrived on the UDP socket from `from`, addressed to
    /// `local` when the socket reports it.
    pub fn udp_recv(&self, datagram: &mut [u8], from: SocketAddr, local: Option<IpAddr>) {
        let opcode = match proto::opcode_from_packet(datagram) {
            Some(op) => op,
            None => return self.drop_rx(None, DcoError::MalformedHeader),
        };
        if opcode != DATA_V2 {
            return self.userspace.forward_control(None, Some(from), datagram);
        }

        let peer = match proto::peer_id_from_packet(datagram) {
            Some(PEER_ID_UNDEF) => self.registry.lookup_by_transport_addr(&from),
            Some(id) => self.registry.lookup_by_id(id),
            None => return self.drop_rx(None, DcoError::MalformedHeader),
        };
        let peer = match peer {
            Some(peer) if !peer.transport().is_tcp() => peer,
            _ => return self.drop_rx(None, DcoError::NoPeer),
        };

        let moved = !peer.bind_matches(&from);
        let wire_len = datagram.len();
        let result = aead::decrypt(peer.crypto(), datagram);

        if result.is_ok() {
            // Only authenticated traffic may move a peer
            if moved {
                self.float(&peer, from);
            }
            if let Some(local) = local {
                peer.learn_local(local);
            }
        }
        self.decrypt_post(peer, wire_len, result.map(|p| p as &[u8]))
    }

    fn float(&self, peer: &Arc<Peer>, from: SocketAddr) {
        if !self.udp.supports(&from) {
            tracing::debug!(message = "Ignoring float to unsupported family", peer_id = peer.id(), remote = %from);
            return;
        }
        if peer.float(from) {
            tracing::debug!(message = "Peer floated", peer_id = peer.id(), remote = %from);
            self.registry.rehash_transport(peer);
        }
    }

    /// Bytes read from the stream of TCP peer `peer_id`.
    pub fn tcp_recv(&self, peer_id: u32, data: &[u8]) {
        let peer = match self.registry.lookup_by_id(peer_id) {
            Some(peer) => peer,
            None => return,
        };
        let link = match peer.transport() {
            PeerTransport::Tcp(link) => link,
            PeerTransport::Udp => return,
        };

        link.framer().lock().push(data);
        loop {
            let next = link.framer().lock().next_frame();
            match next {
                Ok(Some(mut frame)) => self.tcp_recv_frame(&peer, &mut frame),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(message = "Broken TCP framing", peer_id, error = ?e);
                    self.delete(&peer, DeleteReason::TransportError);
                    break;
                }
            }
        }
    }

    fn tcp_recv_frame(&self, peer: &Arc<Peer>, frame: &mut [u8]) {
        let unit = &mut frame[TCP_LEN_PREFIX_SZ..];
        if proto::opcode_from_packet(unit) != Some(DATA_V2) {
            return self.userspace.forward_control(Some(peer.id()), None, frame);
        }
        let wire_len = unit.len();
        let result = aead::decrypt(peer.crypto(), unit);
        self.decrypt_post(Arc::clone(peer), wire_len, result.map(|p| p as &[u8]))
    }

    /// The stream of a TCP peer can take more data.
    pub fn tcp_write_space(&self, peer_id: u32) {
        let peer = match self.registry.lookup_by_id(peer_id) {
            Some(peer) => peer,
            None => return,
        };
        if let PeerTransport::Tcp(link) = peer.transport() {
            if link.write_space().is_err() {
                self.delete(&peer, DeleteReason::TransportError);
            }
        }
    }

    /// The stream of a TCP peer was closed by the remote.
    pub fn tcp_disconnect(&self, peer_id: u32) {
        if let Some(peer) = self.registry.lookup_by_id(peer_id) {
            self.delete(&peer, DeleteReason::TransportDisconnect);
        }
    }

    /// Completion of a decryption, may run on any thread.
    pub fn decrypt_post(&self, peer: Arc<Peer>, wire_len: usize, result: Result<&[u8], DcoError>) {
        let packet = match result {
            Ok(packet) => packet,
            Err(e) => return self.drop_rx(Some(peer.id()), e),
        };

        if packet == KEEPALIVE_MESSAGE {
            tracing::trace!(message = "Keepalive received", peer_id = peer.id());
            peer.keepalive_recv_reset(Instant::now());
            peer.stats().link.add_rx(wire_len);
            return;
        }

        let src = match proto::src_address(packet) {
            Some(src) => src,
            None => return self.drop_rx(Some(peer.id()), DcoError::UnsupportedProtocol),
        };
        if !self
            .registry
            .check_by_source(&peer, src, self.router.as_ref())
        {
            return self.drop_rx(Some(peer.id()), DcoError::ReversePathMismatch);
        }

        // Only packets that make it to the interface count as liveness
        peer.keepalive_recv_reset(Instant::now());
        peer.stats().link.add_rx(wire_len);
        peer.stats().vpn.add_rx(packet.len());
        self.tun.inject_plaintext(packet);
    }

    /// Run the keepalive timers of every peer as of `now`.
    ///
    /// Expired peers are deleted and due pings are sent. Returns the
    /// earliest instant any timer needs attention again, which is also
    /// handed to the keepalive worker.
    pub fn keepalive_work(&self, now: Instant) -> Option<Instant> {
        let mut next_run = None;
        for peer in self.registry.snapshot() {
            match peer.keepalive_check(now) {
                KeepaliveVerdict::Disabled => {}
                KeepaliveVerdict::Expired => {
                    tracing::debug!(message = "Peer expired", peer_id = peer.id());
                    self.delete(&peer, DeleteReason::Expired);
                }
                KeepaliveVerdict::SendPing { next_run: next } => {
                    tracing::trace!(message = "Sending keepalive", peer_id = peer.id());
                    self.encrypt_one(Arc::clone(&peer), &KEEPALIVE_MESSAGE);
                    peer.keepalive_xmit_reset(now);
                    next_run = earliest(next_run, Some(next));
                }
                KeepaliveVerdict::Idle { next_run: next } => {
                    next_run = earliest(next_run, Some(next));
                }
            }
        }
        if !self.keepalive.is_stopped() {
            self.keepalive.schedule(next_run);
        }
        next_run
    }
}
