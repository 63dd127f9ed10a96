// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Peer lookup.
//!
//! In point-to-point mode there is a single peer slot. In multi-peer mode
//! peers are indexed three ways: by peer id (authoritative), by VPN
//! address and by transport address. All index mutations happen under one
//! registry lock; lookups take it for reading only and hand out an `Arc`,
//! so a peer removed from the indices stays alive for whoever still holds
//! it.
//!
//! Lock order: a peer's own locks may be taken while holding the registry
//! lock, never the other way round.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::RwLock;

use super::peer::{Peer, VpnAddrs};
use super::route::Router;
use super::{Error, Mode};

#[derive(Default)]
struct PeerTables {
    by_id: HashMap<u32, Arc<Peer>>,
    by_vpn_addr: HashMap<IpAddr, Arc<Peer>>,
    by_transp_addr: HashMap<SocketAddr, Arc<Peer>>,
    // Key each peer is currently hashed under in by_transp_addr
    transp_key: HashMap<u32, SocketAddr>,
}

impl PeerTables {
    fn unhash_transp(&mut self, peer: &Arc<Peer>) {
        if let Some(key) = self.transp_key.remove(&peer.id()) {
            if self
                .by_transp_addr
                .get(&key)
                .map_or(false, |p| Arc::ptr_eq(p, peer))
            {
                self.by_transp_addr.remove(&key);
            }
        }
    }

    fn hash_transp(&mut self, peer: &Arc<Peer>) {
        if peer.transport().is_tcp() {
            return;
        }
        if let Some(bind) = peer.bind() {
            self.by_transp_addr.insert(bind.remote, Arc::clone(peer));
            self.transp_key.insert(peer.id(), bind.remote);
        }
    }

    fn unhash_vpn(&mut self, peer: &Arc<Peer>, addrs: &VpnAddrs) {
        for addr in addrs.iter() {
            if self
                .by_vpn_addr
                .get(&addr)
                .map_or(false, |p| Arc::ptr_eq(p, peer))
            {
                self.by_vpn_addr.remove(&addr);
            }
        }
    }

    fn hash_vpn(&mut self, peer: &Arc<Peer>, addrs: &VpnAddrs) {
        for addr in addrs.iter() {
            if let Some(prev) = self.by_vpn_addr.insert(addr, Arc::clone(peer)) {
                if !Arc::ptr_eq(&prev, peer) {
                    tracing::warn!(
                        message = "VPN address moved to another peer",
                        address = %addr,
                        from = prev.id(),
                        to = peer.id()
                    );
                }
            }
        }
    }

    fn is_hashed(&self, peer: &Arc<Peer>) -> bool {
        self.by_id
            .get(&peer.id())
            .map_or(false, |p| Arc::ptr_eq(p, peer))
    }
}

pub struct PeerRegistry {
    mode: Mode,
    p2p: RwLock<Option<Arc<Peer>>>,
    tables: RwLock<PeerTables>,
}

impl PeerRegistry {
    pub fn new(mode: Mode) -> Self {
        PeerRegistry {
            mode,
            p2p: RwLock::new(None),
            tables: RwLock::new(PeerTables::default()),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Make `peer` visible to lookups.
    ///
    /// In multi-peer mode a duplicate id is refused and nothing changes. In
    /// point-to-point mode the new peer replaces the singleton; the
    /// replaced peer is returned so the caller can finish tearing it down.
    pub fn add(&self, peer: Arc<Peer>) -> Result<Option<Arc<Peer>>, Error> {
        match self.mode {
            Mode::P2P => Ok(self.p2p.write().replace(peer)),
            Mode::MP => {
                let mut tables = self.tables.write();
                if tables.by_id.contains_key(&peer.id()) {
                    return Err(Error::AlreadyExists(peer.id()));
                }
                tables.by_id.insert(peer.id(), Arc::clone(&peer));
                tables.hash_vpn(&peer, &peer.vpn_addrs());
                tables.hash_transp(&peer);
                Ok(None)
            }
        }
    }

    /// Unhash `peer` from every index. Returns true only for the call that
    /// actually removed it.
    pub fn remove(&self, peer: &Arc<Peer>) -> bool {
        match self.mode {
            Mode::P2P => {
                let mut p2p = self.p2p.write();
                if p2p.as_ref().map_or(false, |p| Arc::ptr_eq(p, peer)) {
                    *p2p = None;
                    true
                } else {
                    false
                }
            }
            Mode::MP => {
                let mut tables = self.tables.write();
                if !tables.is_hashed(peer) {
                    return false;
                }
                tables.by_id.remove(&peer.id());
                tables.unhash_vpn(peer, &peer.vpn_addrs());
                tables.unhash_transp(peer);
                true
            }
        }
    }

    pub fn lookup_by_id(&self, id: u32) -> Option<Arc<Peer>> {
        match self.mode {
            Mode::P2P => self.p2p.read().as_ref().filter(|p| p.id() == id).cloned(),
            Mode::MP => self.tables.read().by_id.get(&id).cloned(),
        }
    }

    pub fn lookup_by_vpn_addr(&self, addr: IpAddr) -> Option<Arc<Peer>> {
        match self.mode {
            Mode::P2P => self
                .p2p
                .read()
                .as_ref()
                .filter(|p| p.vpn_addrs().contains(addr))
                .cloned(),
            Mode::MP => self.tables.read().by_vpn_addr.get(&addr).cloned(),
        }
    }

    pub fn lookup_by_transport_addr(&self, addr: &SocketAddr) -> Option<Arc<Peer>> {
        match self.mode {
            Mode::P2P => self
                .p2p
                .read()
                .as_ref()
                .filter(|p| p.bind_matches(addr))
                .cloned(),
            Mode::MP => self.tables.read().by_transp_addr.get(addr).cloned(),
        }
    }

    /// Peer that carries traffic toward `dst`.
    pub fn get_by_dst(&self, dst: IpAddr, router: &dyn Router) -> Option<Arc<Peer>> {
        match self.mode {
            Mode::P2P => self.p2p.read().clone(),
            Mode::MP => self.lookup_by_vpn_addr(router.nexthop(dst)),
        }
    }

    /// Reverse-path check: would traffic toward `src` be sent to `peer`?
    pub fn check_by_source(&self, peer: &Arc<Peer>, src: IpAddr, router: &dyn Router) -> bool {
        self.get_by_dst(src, router)
            .map_or(false, |p| Arc::ptr_eq(&p, peer))
    }

    /// Re-key the transport index after `peer` floated.
    ///
    /// Uses the peer's binding at the time the registry lock is held, so
    /// concurrent floats converge on the latest one.
    pub fn rehash_transport(&self, peer: &Arc<Peer>) {
        if self.mode == Mode::P2P {
            return;
        }
        let mut tables = self.tables.write();
        if !tables.is_hashed(peer) {
            return;
        }
        tables.unhash_transp(peer);
        tables.hash_transp(peer);
    }

    /// Replace the VPN addresses of `peer` and its VPN index entries.
    pub fn rehash_vpn(&self, peer: &Arc<Peer>, addrs: VpnAddrs) {
        match self.mode {
            Mode::P2P => {
                let _guard = self.p2p.write();
                peer.set_vpn_addrs(addrs);
            }
            Mode::MP => {
                let mut tables = self.tables.write();
                if !tables.is_hashed(peer) {
                    peer.set_vpn_addrs(addrs);
                    return;
                }
                tables.unhash_vpn(peer, &peer.vpn_addrs());
                peer.set_vpn_addrs(addrs);
                tables.hash_vpn(peer, &addrs);
            }
        }
    }

    /// All peers currently hashed, taken under the read lock.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        match self.mode {
            Mode::P2P => self.p2p.read().iter().cloned().collect(),
            Mode::MP => self.tables.read().by_id.values().cloned().collect(),
        }
    }

    /// Unhash everything, handing the peers back to the caller.
    pub fn drain(&self) -> Vec<Arc<Peer>> {
        match self.mode {
            Mode::P2P => self.p2p.write().take().into_iter().collect(),
            Mode::MP => {
                let mut tables = self.tables.write();
                let peers = tables.by_id.drain().map(|(_, p)| p).collect();
                *tables = PeerTables::default();
                peers
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.mode {
            Mode::P2P => usize::from(self.p2p.read().is_some()),
            Mode::MP => self.tables.read().by_id.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn index_sizes(&self) -> (usize, usize, usize) {
        let t = self.tables.read();
        (t.by_id.len(), t.by_vpn_addr.len(), t.by_transp_addr.len())
    }
}
