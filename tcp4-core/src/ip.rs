//! Interface consumed from the raw IPv4 layer.
//!
//! The socket core never touches link devices or routing tables itself;
//! everything below TCP is reached through [Ip4Link]. Inbound traffic
//! flows the other way: the IP demultiplexer hands [Ip4Packet]s to
//! [Tcp4::feed_datagram] synchronously.
//!
//! [Tcp4::feed_datagram]: crate::demux::Tcp4::feed_datagram

use crate::Result;

/// IP protocol number of TCP.
pub const PROTO_TCP: u8 = 6;

/// Routing result binding a remote address to a chosen source address and
/// link.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    /// Source address to emit from, in host order.
    pub source: u32,
    /// Link selector; opaque to the TCP core, interpreted by the IP
    /// layer when the frame is sent.
    pub link: u64,
}

/// An inbound IPv4 packet, already reassembled and classified as TCP by
/// the IP layer.
#[derive(Debug, Clone)]
pub struct Ip4Packet {
    /// Source address, in host order.
    pub src: u32,
    /// Destination address, in host order.
    pub dst: u32,
    /// The IP payload (TCP header plus data).
    pub payload: Vec<u8>,
}

/// The raw IP layer underneath the socket core.
///
/// `target_by_remote` and `send_frame` may block while the IP layer
/// resolves routes or waits for link capacity.
pub trait Ip4Link: Send + Sync {
    /// Returns `true` if `ip` is one of the local stack's addresses.
    fn has_ip(&self, ip: u32) -> bool;

    /// Resolves the routing target for `remote_ip`, or `None` if the
    /// destination is unreachable.
    fn target_by_remote(&self, remote_ip: u32) -> Option<TargetInfo>;

    /// Emits one frame carrying `proto` towards the resolved target.
    fn send_frame(&self, target: &TargetInfo, frame: &[u8], proto: u8) -> Result<()>;
}
