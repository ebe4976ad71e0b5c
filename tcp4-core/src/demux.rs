//! The TCP/IPv4 demultiplexer: endpoint bindings and inbound dispatch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::debug;
use crate::endpoint::{TcpEndpoint, INADDR_ANY};
use crate::ip::{Ip4Link, Ip4Packet};
use crate::segment::TcpPacket;
use crate::socket::{SocketInner, Tcp4Socket};

/// Maps `(local address, local port)` endpoints to sockets and routes
/// inbound segments to them.
///
/// The binding map is sorted by `(port, ip)`, so all bindings of one port
/// form a contiguous range. Two bindings may share a port only if they
/// name distinct addresses and neither is the wildcard; the wildcard can
/// therefore never shadow a specific binding.
pub struct Tcp4 {
    link: Arc<dyn Ip4Link>,
    binds: Mutex<BTreeMap<TcpEndpoint, Weak<SocketInner>>>,
}

impl Tcp4 {
    /// Creates a demultiplexer above the given IP layer.
    pub fn new(link: Arc<dyn Ip4Link>) -> Arc<Self> {
        Arc::new(Self {
            link,
            binds: Mutex::new(BTreeMap::new()),
        })
    }

    /// Creates a socket served by this demultiplexer.
    pub fn socket(self: &Arc<Self>) -> Tcp4Socket {
        Tcp4Socket::new(Arc::clone(self))
    }

    pub(crate) fn link(&self) -> &Arc<dyn Ip4Link> {
        &self.link
    }

    /// Claims `wanted` for `socket`.
    ///
    /// Fails if any existing binding of the port conflicts: an exact
    /// address match, or either side being [INADDR_ANY].
    pub(crate) fn try_bind(&self, socket: &Arc<SocketInner>, wanted: TcpEndpoint) -> bool {
        let mut binds = self.binds.lock().unwrap();

        let port_range = TcpEndpoint::new(0, wanted.port)..=TcpEndpoint::new(u32::MAX, wanted.port);
        for (existing, _) in binds.range(port_range) {
            if existing.ip == INADDR_ANY
                || wanted.ip == INADDR_ANY
                || existing.ip == wanted.ip
            {
                return false;
            }
        }

        socket.set_local_ep(wanted);
        binds.insert(wanted, Arc::downgrade(socket));
        true
    }

    /// Releases a binding. Returns `false` if it did not exist.
    pub(crate) fn unbind(&self, ep: TcpEndpoint) -> bool {
        self.binds.lock().unwrap().remove(&ep).is_some()
    }

    /// Parses an inbound IP payload as TCP and dispatches it to the first
    /// matching binding. Unparsable and unclaimed segments are dropped.
    pub fn feed_datagram(&self, packet: &Ip4Packet) {
        let tcp = match TcpPacket::parse(packet) {
            Ok(tcp) => tcp,
            Err(error) => {
                debug!("dropping broken TCP segment: {error}");
                return;
            }
        };

        debug!(
            "received TCP segment at port {} ({} bytes)",
            tcp.header.dst_port(),
            tcp.payload().len()
        );

        let socket = {
            let binds = self.binds.lock().unwrap();
            let port = tcp.header.dst_port();
            let port_range = TcpEndpoint::new(0, port)..=TcpEndpoint::new(u32::MAX, port);

            let mut found = None;
            for (existing, slot) in binds.range(port_range) {
                if existing.ip == packet.dst || existing.ip == INADDR_ANY {
                    found = slot.upgrade();
                    break;
                }
            }
            found
        };

        if let Some(socket) = socket {
            socket.handle_in_packet(tcp);
        }
    }
}

impl fmt::Debug for Tcp4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcp4")
            .field("binds", &self.binds.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}
