// Copyright (c) 2024 Cableguard, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Transport side collaborators and the per-peer TCP state.

use std::io;
use std::net::SocketAddr;

use parking_lot::Mutex;

use super::bind::Bind;
use crate::errors::DcoError;
use crate::proto::{tcp_frame, tcp_frame_len};

/// Shared UDP socket(s) of a device.
pub trait DatagramTransport: Send + Sync {
    /// Whether a datagram can be sent to `remote` at all, e.g. an IPv6
    /// remote on a device that only has an IPv4 socket.
    fn supports(&self, remote: &SocketAddr) -> bool;

    fn send_datagram(&self, bind: &Bind, packet: &[u8]) -> io::Result<()>;
}

/// The connected stream a TCP peer is attached to.
pub trait StreamTransport: Send + Sync {
    /// Write as much of `data` as the stream accepts right now. Returns
    /// `ErrorKind::WouldBlock` when nothing fits.
    fn write(&self, data: &[u8]) -> io::Result<usize>;
}

/// How a peer's traffic leaves the device.
pub enum PeerTransport {
    Udp,
    Tcp(TcpLink),
}

impl PeerTransport {
    pub fn is_tcp(&self) -> bool {
        matches!(self, PeerTransport::Tcp(_))
    }
}

impl std::fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerTransport::Udp => f.write_str("Udp"),
            PeerTransport::Tcp(_) => f.write_str("Tcp"),
        }
    }
}

/// Reassembles length-prefixed units from a byte stream.
#[derive(Debug, Default)]
pub struct TcpFramer {
    buf: Vec<u8>,
}

impl TcpFramer {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, length prefix included.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, DcoError> {
        let len = match tcp_frame_len(&self.buf)? {
            Some(len) if len <= self.buf.len() => len,
            _ => return Ok(None),
        };
        let rest = self.buf.split_off(len);
        Ok(Some(std::mem::replace(&mut self.buf, rest)))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug)]
struct PendingOut {
    frame: Vec<u8>,
    offset: usize,
}

/// A TCP peer's stream with its single outgoing slot and its receive
/// reassembly buffer.
pub struct TcpLink {
    stream: Box<dyn StreamTransport>,
    pending: Mutex<Option<PendingOut>>,
    framer: Mutex<TcpFramer>,
}

impl TcpLink {
    pub fn new(stream: Box<dyn StreamTransport>) -> Self {
        TcpLink {
            stream,
            pending: Mutex::new(None),
            framer: Mutex::new(TcpFramer::default()),
        }
    }

    /// Frame and write one unit.
    ///
    /// Whatever the stream does not take now stays pending until
    /// [`TcpLink::write_space`]. While something is pending every new unit
    /// is refused with `TransportBusy`. `TransportError` means the stream
    /// is broken.
    pub fn send(&self, unit: &[u8]) -> Result<(), DcoError> {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return Err(DcoError::TransportBusy);
        }
        let frame = tcp_frame(unit)?;
        *pending = self.flush(PendingOut { frame, offset: 0 })?;
        Ok(())
    }

    /// The stream can take more data: retry the pending frame.
    pub fn write_space(&self) -> Result<(), DcoError> {
        let mut pending = self.pending.lock();
        if let Some(out) = pending.take() {
            *pending = self.flush(out)?;
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub(crate) fn framer(&self) -> &Mutex<TcpFramer> {
        &self.framer
    }

    fn flush(&self, mut out: PendingOut) -> Result<Option<PendingOut>, DcoError> {
        while out.offset < out.frame.len() {
            match self.stream.write(&out.frame[out.offset..]) {
                Ok(0) => return Err(DcoError::TransportError),
                Ok(n) => out.offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Some(out)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => return Err(DcoError::TransportError),
            }
        }
        Ok(None)
    }
}
