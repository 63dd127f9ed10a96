// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::net::{IpAddr, SocketAddr};

/// Where a UDP peer is reached: its remote address plus the local address
/// traffic from it was last received on.
///
/// A `Bind` is never modified once published; a float or a newly learned
/// local address publishes a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bind {
    pub remote: SocketAddr,
    pub local: Option<IpAddr>,
}

impl Bind {
    pub fn new(remote: SocketAddr, local: Option<IpAddr>) -> Bind {
        // A local address of the other family can never source packets to `remote`
        let local = local.filter(|l| l.is_ipv4() == remote.is_ipv4());
        Bind { remote, local }
    }

    /// Bind for a peer that moved to `remote`. The learned local address
    /// survives as long as the address family does not change.
    pub fn floated(&self, remote: SocketAddr) -> Bind {
        Bind::new(remote, self.local)
    }

    /// Same bind with a different local address, `None` if nothing changes.
    pub fn with_local(&self, local: IpAddr) -> Option<Bind> {
        if self.local == Some(local) || local.is_ipv4() != self.remote.is_ipv4() {
            return None;
        }
        Some(Bind {
            remote: self.remote,
            local: Some(local),
        })
    }
}
