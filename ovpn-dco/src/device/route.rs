// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

use std::net::IpAddr;

use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use parking_lot::RwLock;

/// Routing decision used to pick the peer behind a VPN address.
///
/// The same answer serves outbound peer selection and the reverse-path
/// check of inbound packets.
pub trait Router: Send + Sync {
    /// Gateway of the route to `dst`, or `dst` itself when it is directly
    /// reachable.
    fn nexthop(&self, dst: IpAddr) -> IpAddr;
}

/// Every address is its own next hop.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectRouter;

impl Router for DirectRouter {
    fn nexthop(&self, dst: IpAddr) -> IpAddr {
        dst
    }
}

/// Longest-prefix table of networks reachable through a gateway, e.g. the
/// LAN behind a client whose VPN address is the gateway.
pub struct RouteTable {
    routes: RwLock<IpNetworkTable<IpAddr>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        RouteTable {
            routes: RwLock::new(IpNetworkTable::new()),
        }
    }

    /// Returns the gateway previously routing `network`, if any.
    pub fn add_route(&self, network: IpNetwork, via: IpAddr) -> Option<IpAddr> {
        self.routes.write().insert(network, via)
    }

    pub fn remove_route(&self, network: IpNetwork) -> Option<IpAddr> {
        self.routes.write().remove(network)
    }

    /// Drop every route through `via`.
    pub fn remove_gateway(&self, via: IpAddr) {
        self.routes.write().retain(|_, gw| *gw != via);
    }

    pub fn routes(&self) -> Vec<(IpNetwork, IpAddr)> {
        let routes = self.routes.read();
        routes.iter().map(|(net, gw)| (net, *gw)).collect()
    }
}

impl Router for RouteTable {
    fn nexthop(&self, dst: IpAddr) -> IpAddr {
        self.routes
            .read()
            .longest_match(dst)
            .map(|(_, gw)| *gw)
            .unwrap_or(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct() {
        let ip: IpAddr = "10.8.0.2".parse().unwrap();
        assert_eq!(DirectRouter.nexthop(ip), ip);
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::new();
        let gw_a: IpAddr = "10.8.0.2".parse().unwrap();
        let gw_b: IpAddr = "10.8.0.3".parse().unwrap();
        table.add_route("192.168.0.0/16".parse().unwrap(), gw_a);
        table.add_route("192.168.7.0/24".parse().unwrap(), gw_b);

        assert_eq!(table.nexthop("192.168.1.1".parse().unwrap()), gw_a);
        assert_eq!(table.nexthop("192.168.7.1".parse().unwrap()), gw_b);
        let other: IpAddr = "10.8.0.9".parse().unwrap();
        assert_eq!(table.nexthop(other), other);

        table.remove_gateway(gw_b);
        assert_eq!(table.nexthop("192.168.7.1".parse().unwrap()), gw_a);
        assert_eq!(table.routes().len(), 1);
    }
}
