// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Runs a [`Device`] on OS threads: UDP receive, tunnel read, the
//! keepalive timer and the control socket.

use std::fs::{create_dir, remove_file, File};
use std::io::{self, BufReader, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Type};

use super::api;
use super::bind::Bind;
use super::drop_privileges::get_saved_ids;
use super::route::RouteTable;
use super::transport::DatagramTransport;
use super::{DeleteReason, Device, DeviceConfig, Error, Interface, Userspace};
use crate::config::ProvisioningConfig;
use crate::Instant;

const MAX_UDP_SIZE: usize = (1 << 16) - 1;
// How often blocked threads look at the running flag
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const API_READ_TIMEOUT: Duration = Duration::from_secs(5);
const SOCK_DIR: &str = "/var/run/ovpn-dco/";

/// The device's listening sockets, one per address family.
pub struct UdpSockets {
    udp4: UdpSocket,
    udp6: Option<UdpSocket>,
    port: u16,
}

impl UdpSockets {
    /// Bind both families to `port`, 0 picks a free one.
    pub fn open(mut port: u16, use_ipv6: bool) -> Result<UdpSockets, Error> {
        let udp4 = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(Error::Socket)?;
        udp4.set_reuse_address(true).map_err(Error::Socket)?;
        udp4.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .map_err(Error::Socket)?;

        if port == 0 {
            // Random port was assigned
            port = udp4.local_addr()?.as_socket().map_or(0, |a| a.port());
        }

        let udp6 = if use_ipv6 {
            let udp6 = socket2::Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
                .map_err(Error::Socket)?;
            udp6.set_only_v6(true).map_err(Error::Socket)?;
            udp6.set_reuse_address(true).map_err(Error::Socket)?;
            udp6.bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into())
                .map_err(Error::Socket)?;
            Some(UdpSocket::from(udp6))
        } else {
            None
        };

        let sockets = UdpSockets {
            udp4: UdpSocket::from(udp4),
            udp6,
            port,
        };
        for socket in sockets.sockets() {
            socket
                .set_read_timeout(Some(POLL_INTERVAL))
                .map_err(Error::Socket)?;
        }
        pktinfo::enable(&sockets.udp4, false).map_err(Error::Socket)?;
        if let Some(udp6) = &sockets.udp6 {
            pktinfo::enable(udp6, true).map_err(Error::Socket)?;
        }
        Ok(sockets)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn sockets(&self) -> impl Iterator<Item = &UdpSocket> {
        std::iter::once(&self.udp4).chain(self.udp6.as_ref())
    }
}

impl DatagramTransport for UdpSockets {
    fn supports(&self, remote: &SocketAddr) -> bool {
        remote.is_ipv4() || self.udp6.is_some()
    }

    fn send_datagram(&self, bind: &Bind, packet: &[u8]) -> io::Result<()> {
        let socket = match bind.remote {
            SocketAddr::V4(_) => &self.udp4,
            SocketAddr::V6(_) => self
                .udp6
                .as_ref()
                .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))?,
        };
        match bind.local {
            Some(local) => match pktinfo::send_from(socket, packet, bind.remote, local) {
                // The learned address went away, let the kernel pick one
                Err(e) if pktinfo::is_bad_source(&e) => {
                    tracing::trace!(message = "Source address rejected", local = %local, error = ?e);
                    socket.send_to(packet, bind.remote).map(|_| ())
                }
                result => result,
            },
            None => socket.send_to(packet, bind.remote).map(|_| ()),
        }
    }
}

/// Destination address reporting and source address selection for the
/// UDP sockets, through `IP_PKTINFO` / `IPV6_PKTINFO` control messages.
#[cfg(target_os = "linux")]
mod pktinfo {
    use std::io::{self, IoSlice, IoSliceMut};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
    use std::os::unix::io::AsRawFd;

    use nix::errno::Errno;
    use nix::sys::socket::{
        recvmsg, sendmsg, setsockopt, sockopt, ControlMessage, ControlMessageOwned, MsgFlags,
        SockaddrStorage,
    };

    pub(super) fn enable(socket: &UdpSocket, v6: bool) -> io::Result<()> {
        if v6 {
            setsockopt(socket, sockopt::Ipv6RecvPacketInfo, &true)?;
        } else {
            setsockopt(socket, sockopt::Ipv4PacketInfo, &true)?;
        }
        Ok(())
    }

    /// Receive one datagram: its length, sender and the local address it
    /// was sent to.
    pub(super) fn recv(
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        let mut cmsg = nix::cmsg_space!(libc::in_pktinfo, libc::in6_pktinfo);
        let mut iov = [IoSliceMut::new(buf)];
        let msg = recvmsg::<SockaddrStorage>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )?;

        let from = msg
            .address
            .as_ref()
            .and_then(to_socket_addr)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))?;
        let local = msg.cmsgs().find_map(|c| match c {
            ControlMessageOwned::Ipv4PacketInfo(info) => Some(IpAddr::V4(Ipv4Addr::from(
                info.ipi_addr.s_addr.to_ne_bytes(),
            ))),
            ControlMessageOwned::Ipv6PacketInfo(info) => {
                Some(IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)))
            }
            _ => None,
        });
        Ok((msg.bytes, from, local))
    }

    fn to_socket_addr(addr: &SockaddrStorage) -> Option<SocketAddr> {
        if let Some(sin) = addr.as_sockaddr_in() {
            return Some(SocketAddr::V4(SocketAddrV4::from(*sin)));
        }
        addr.as_sockaddr_in6()
            .map(|sin6| SocketAddr::V6(SocketAddrV6::from(*sin6)))
    }

    /// Send `packet` to `remote` with `local` as source address.
    pub(super) fn send_from(
        socket: &UdpSocket,
        packet: &[u8],
        remote: SocketAddr,
        local: IpAddr,
    ) -> io::Result<()> {
        let iov = [IoSlice::new(packet)];
        let dst = SockaddrStorage::from(remote);
        let fd = socket.as_raw_fd();
        match local {
            IpAddr::V4(local) => {
                let info = libc::in_pktinfo {
                    ipi_ifindex: 0,
                    ipi_spec_dst: libc::in_addr {
                        s_addr: u32::from_ne_bytes(local.octets()),
                    },
                    ipi_addr: libc::in_addr { s_addr: 0 },
                };
                let cmsgs = [ControlMessage::Ipv4PacketInfo(&info)];
                sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&dst))?;
            }
            IpAddr::V6(local) => {
                let info = libc::in6_pktinfo {
                    ipi6_addr: libc::in6_addr {
                        s6_addr: local.octets(),
                    },
                    ipi6_ifindex: 0,
                };
                let cmsgs = [ControlMessage::Ipv6PacketInfo(&info)];
                sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&dst))?;
            }
        }
        Ok(())
    }

    pub(super) fn is_bad_source(e: &io::Error) -> bool {
        matches!(
            e.raw_os_error().map(Errno::from_i32),
            Some(Errno::EINVAL | Errno::EADDRNOTAVAIL)
        )
    }
}

/// Plain sockets where the platform has no pktinfo support: the kernel
/// picks the source address and the destination is not reported.
#[cfg(not(target_os = "linux"))]
mod pktinfo {
    use std::io;
    use std::net::{IpAddr, SocketAddr, UdpSocket};

    pub(super) fn enable(_socket: &UdpSocket, _v6: bool) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn recv(
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<IpAddr>)> {
        socket.recv_from(buf).map(|(n, from)| (n, from, None))
    }

    pub(super) fn send_from(
        socket: &UdpSocket,
        packet: &[u8],
        remote: SocketAddr,
        _local: IpAddr,
    ) -> io::Result<()> {
        socket.send_to(packet, remote).map(|_| ())
    }

    pub(super) fn is_bad_source(_e: &io::Error) -> bool {
        false
    }
}

/// A layer 3 tunnel device without packet information headers.
pub struct TunFd {
    file: File,
}

#[cfg(target_os = "linux")]
mod tun_linux {
    pub(super) const IFF_TUN: libc::c_short = 0x0001;
    pub(super) const IFF_NO_PI: libc::c_short = 0x1000;
    pub(super) const TUNSETIFF: u64 = 0x4004_54ca;

    #[repr(C)]
    pub(super) struct IfReq {
        pub(super) ifr_name: [u8; libc::IFNAMSIZ],
        pub(super) ifr_flags: libc::c_short,
        pub(super) _pad: [u8; 22],
    }
}

impl TunFd {
    /// Take ownership of an already configured tunnel descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be an open tunnel descriptor that nothing else closes.
    pub unsafe fn from_raw_fd(fd: i32) -> TunFd {
        TunFd {
            file: File::from_raw_fd(fd),
        }
    }

    #[cfg(target_os = "linux")]
    pub fn create(name: &str) -> Result<TunFd, Error> {
        use tun_linux::*;

        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(Error::Config(format!("invalid interface name {}", name)));
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(Error::IfaceRead)?;

        let mut req = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        req.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        // Safety: valid descriptor and a request the size of `struct ifreq`
        if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) } < 0 {
            return Err(Error::IfaceRead(io::Error::last_os_error()));
        }
        Ok(TunFd { file })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn create(_name: &str) -> Result<TunFd, Error> {
        Err(Error::IfaceRead(io::ErrorKind::Unsupported.into()))
    }

    /// One packet, or `None` if nothing arrived within the poll interval.
    fn read_packet(&self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // Safety: one valid pollfd
        let ready = unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL.as_millis() as libc::c_int) };
        if ready < 0 {
            let e = io::Error::last_os_error();
            return match e.kind() {
                io::ErrorKind::Interrupted => Ok(None),
                _ => Err(Error::IfaceRead(e)),
            };
        }
        if ready == 0 {
            return Ok(None);
        }
        match (&self.file).read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(Error::IfaceRead(e)),
        }
    }
}

impl Interface for TunFd {
    fn inject_plaintext(&self, packet: &[u8]) {
        if let Err(e) = (&self.file).write(packet) {
            tracing::trace!(message = "Tunnel write failed", error = ?e);
        }
    }
}

/// Stands in for the control process when none is attached.
struct LogUserspace;

impl Userspace for LogUserspace {
    fn forward_control(&self, peer_id: Option<u32>, from: Option<SocketAddr>, packet: &[u8]) {
        tracing::debug!(
            message = "Control packet with no control process attached",
            peer_id = ?peer_id,
            from = ?from,
            len = packet.len()
        );
    }

    fn peer_deleted(&self, peer_id: u32, reason: DeleteReason) {
        tracing::debug!(message = "Peer deletion notified", peer_id, reason = %reason);
    }
}

struct Shared {
    device: Device,
    routes: Arc<RouteTable>,
    running: AtomicBool,
    uapi: Mutex<Option<UnixStream>>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn trigger_exit(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Device shutting down");
        self.device.shutdown();
        if let Some(conn) = self.uapi.lock().take() {
            let _ = conn.shutdown(std::net::Shutdown::Both);
        }
    }
}

pub struct DeviceHandle {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    cleanup_paths: Vec<String>,
    listen_port: u16,
}

impl DeviceHandle {
    pub fn new(name: &str, config: &DeviceConfig) -> Result<DeviceHandle, Error> {
        let tun = Arc::new(if config.tun_fd >= 0 {
            // Safety: the descriptor was handed to us to own
            unsafe { TunFd::from_raw_fd(config.tun_fd) }
        } else {
            TunFd::create(name)?
        });
        let udp = Arc::new(UdpSockets::open(config.listen_port, config.use_ipv6)?);
        let routes = Arc::new(RouteTable::new());

        let device = Device::new(
            config.mode,
            Arc::clone(&udp) as _,
            Arc::clone(&tun) as _,
            Arc::new(LogUserspace),
            Arc::clone(&routes) as _,
        );
        let mut handle = DeviceHandle {
            shared: Arc::new(Shared {
                device,
                routes,
                running: AtomicBool::new(true),
                uapi: Mutex::new(None),
            }),
            threads: vec![],
            cleanup_paths: vec![],
            listen_port: udp.port(),
        };

        for i in 0..config.n_threads.max(1) {
            for socket in udp.sockets() {
                let socket = socket.try_clone().map_err(Error::Socket)?;
                handle.spawn(&format!("udp-{}", i), move |shared| udp_loop(shared, &socket))?;
            }
        }
        handle.spawn("tun", move |shared| tun_loop(shared, &tun))?;
        handle.spawn("keepalive", keepalive_loop)?;

        if config.uapi_fd >= 0 {
            // Safety: the descriptor was handed to us to own
            let conn = unsafe { UnixStream::from_raw_fd(config.uapi_fd) };
            *handle.shared.uapi.lock() = Some(conn.try_clone().map_err(Error::ApiSocket)?);
            handle.spawn("api", move |shared| uapi_loop(shared, conn))?;
        } else {
            let (listener, path) = api_listener(name)?;
            handle.cleanup_paths.push(path.clone());
            handle.spawn("api", move |shared| api_loop(shared, &listener, &path))?;
        }

        tracing::info!(
            message = "Device started",
            name,
            mode = %config.mode,
            listen_port = handle.listen_port,
            threads = config.n_threads
        );
        Ok(handle)
    }

    fn spawn<F>(&mut self, name: &str, f: F) -> Result<(), Error>
    where
        F: FnOnce(&Shared) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || f(&shared))?;
        self.threads.push(thread);
        Ok(())
    }

    pub fn device(&self) -> &Device {
        &self.shared.device
    }

    pub fn routes(&self) -> &RouteTable {
        &self.shared.routes
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn apply_config(&self, config: &ProvisioningConfig) -> Result<(), Error> {
        config.apply(&self.shared.device, &self.shared.routes)
    }

    pub fn trigger_exit(&self) {
        self.shared.trigger_exit();
    }

    /// Block until every thread has stopped.
    pub fn wait(&mut self) {
        while let Some(thread) = self.threads.pop() {
            if thread.join().is_err() {
                tracing::error!("A device thread panicked");
            }
        }
    }

    pub fn clean(&mut self) {
        for path in &self.cleanup_paths {
            // try to remove any file we created in the work dir
            let _ = remove_file(path);
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.shared.trigger_exit();
        self.clean();
    }
}

fn udp_loop(shared: &Shared, socket: &UdpSocket) {
    let mut buf = vec![0u8; MAX_UDP_SIZE];
    while shared.is_running() {
        match pktinfo::recv(socket, &mut buf) {
            Ok((len, from, local)) => shared.device.udp_recv(&mut buf[..len], from, local),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => tracing::debug!(message = "UDP receive failed", error = ?e),
        }
    }
}

fn tun_loop(shared: &Shared, tun: &TunFd) {
    let mut buf = vec![0u8; MAX_UDP_SIZE];
    while shared.is_running() {
        match tun.read_packet(&mut buf) {
            Ok(Some(len)) => shared.device.accept_plaintext_for_transmit(&buf[..len]),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(message = "Failed read on tun interface", error = ?e);
                shared.trigger_exit();
            }
        }
    }
}

fn keepalive_loop(shared: &Shared) {
    let worker = shared.device.keepalive_worker();
    while worker.wait_until_due() {
        shared.device.keepalive_work(Instant::now());
    }
}

fn produce_sock_dir() {
    let _ = create_dir(SOCK_DIR);

    if let Ok((saved_uid, saved_gid)) = get_saved_ids() {
        if let Ok(c_path) = std::ffi::CString::new(SOCK_DIR) {
            // The directory belongs to root, but the socket must stay
            // removable after privileges are dropped
            unsafe {
                libc::chown(c_path.as_ptr(), saved_uid, saved_gid);
            }
        }
    }
}

fn api_listener(name: &str) -> Result<(UnixListener, String), Error> {
    let path = format!("{}{}.sock", SOCK_DIR, name);
    produce_sock_dir();
    let _ = remove_file(&path);

    let listener = UnixListener::bind(&path).map_err(Error::ApiSocket)?;
    listener.set_nonblocking(true).map_err(Error::ApiSocket)?;
    Ok((listener, path))
}

fn api_loop(shared: &Shared, listener: &UnixListener, path: &str) {
    while shared.is_running() {
        match listener.accept() {
            Ok((conn, _)) => {
                if let Err(e) = serve_api_conn(shared, &conn) {
                    tracing::debug!(message = "API connection failed", error = ?e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Removing the socket stops the device
                if !Path::new(path).exists() {
                    shared.trigger_exit();
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                tracing::debug!(message = "API accept failed", error = ?e);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn serve_api_conn(shared: &Shared, conn: &UnixStream) -> io::Result<()> {
    conn.set_nonblocking(false)?;
    conn.set_read_timeout(Some(API_READ_TIMEOUT))?;
    let mut reader = BufReader::new(conn);
    let mut writer = conn;
    while api::handle_request(&mut reader, &mut writer, &shared.device, &shared.routes)? {}
    Ok(())
}

/// The control connection inherited from the parent; the device lives as
/// long as it stays open.
fn uapi_loop(shared: &Shared, conn: UnixStream) {
    let mut reader = BufReader::new(&conn);
    let mut writer = &conn;
    while shared.is_running() {
        match api::handle_request(&mut reader, &mut writer, &shared.device, &shared.routes) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::debug!(message = "API connection failed", error = ?e);
                break;
            }
        }
    }
    shared.trigger_exit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn udp_sockets_send() {
        let udp = UdpSockets::open(0, false).unwrap();
        assert_ne!(udp.port(), 0);
        assert!(udp.supports(&"192.0.2.1:1194".parse().unwrap()));
        assert!(!udp.supports(&"[2001:db8::1]:1194".parse().unwrap()));

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let bind = Bind::new(receiver.local_addr().unwrap(), None);
        udp.send_datagram(&bind, b"ping").unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.port(), udp.port());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn local_address_is_reported_and_used() {
        let udp = UdpSockets::open(0, false).unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
            .send_to(b"hello", ("127.0.0.1", udp.port()))
            .unwrap();

        let mut buf = [0u8; 16];
        let (n, from, local) = pktinfo::recv(&udp.udp4, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, client.local_addr().unwrap());
        assert_eq!(local, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        let bind = Bind::new(from, local);
        udp.send_datagram(&bind, b"reply").unwrap();
        let (n, reply_from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(
            reply_from,
            SocketAddr::from((Ipv4Addr::LOCALHOST, udp.port()))
        );
    }

    #[test]
    fn v6_send_without_v6_socket_fails() {
        let udp = UdpSockets::open(0, false).unwrap();
        let bind = Bind::new("[::1]:9".parse().unwrap(), None);
        assert!(udp.send_datagram(&bind, b"ping").is_err());
    }
}
