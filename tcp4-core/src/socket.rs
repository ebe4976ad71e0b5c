//! TCP socket state machine: the outbound pump, the inbound handler, and
//! the blocking socket operations.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;

use rand::Rng;

use crate::demux::Tcp4;
use crate::doorbell::Doorbell;
use crate::endpoint::{SockaddrIn, TcpEndpoint, INADDR_ANY, INADDR_BROADCAST};
use crate::ip::PROTO_TCP;
use crate::ring::RingBuffer;
use crate::segment::{TcpHeader, TcpPacket};
use crate::{debug, warn};
use crate::{Error, Result};

/// Upper bound on the payload of one emitted segment.
///
/// A fixed placeholder for future path-MTU discovery.
pub const MTU_PAYLOAD: usize = 1000;

/// Size shift of a socket's send and receive rings (16 KiB each).
///
/// Must stay at or below 15 so the announced window fits the 16-bit wire
/// field.
const RING_SHIFT: u32 = 14;

/// First port of the ephemeral range.
pub const EPHEMERAL_FIRST: u16 = 32768;

/// Last port of the ephemeral range.
pub const EPHEMERAL_LAST: u16 = 60999;

/// Connection lifecycle of a socket.
///
/// Only the active-open path is wired up; `SendSynAck` is declared for
/// the passive-open path but nothing drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    /// No connection attempt has been made.
    None,
    /// An active open is in flight; the pump owes the network a SYN or is
    /// waiting for the peer's SYN+ACK.
    SendSyn,
    /// Reserved for passive open.
    SendSynAck,
    /// The handshake completed; data flows.
    Connected,
}

/// A TCP socket bound into a [Tcp4] demultiplexer.
///
/// Dropping the socket closes it: the pump terminates, blocked operations
/// fail with [Error::ConnectionReset], and the local endpoint is unbound.
pub struct Tcp4Socket {
    inner: Arc<SocketInner>,
}

pub(crate) struct SocketInner {
    parent: Arc<Tcp4>,
    tcb: Mutex<Tcb>,
    /// Rung when bytes arrive in the receive ring.
    in_event: Doorbell,
    /// Rung when the pump may have a segment to emit.
    flush_event: Doorbell,
    /// Rung when the peer settled bytes, the handshake finished, or the
    /// pump died.
    settle_event: Doorbell,
}

struct Tcb {
    local_ep: TcpEndpoint,
    remote_ep: TcpEndpoint,
    state: ConnectState,

    // Out-SN corresponding to the front of the send ring.
    local_settled_sn: u32,
    // Out-SN already placed on the wire (>= local_settled_sn).
    local_flushed_sn: u32,
    // One past the highest out-SN the peer's window permits.
    local_window_sn: u32,
    // In-SN that we already acknowledged.
    remote_acked_sn: u32,
    // In-SN that we already received (>= remote_acked_sn).
    remote_known_sn: u32,
    // Receive window we last announced to the peer.
    announced_window: u32,

    recv_ring: RingBuffer,
    send_ring: RingBuffer,

    closed: bool,
    pump_error: Option<Error>,
}

impl Tcb {
    fn new() -> Self {
        Self {
            local_ep: TcpEndpoint::default(),
            remote_ep: TcpEndpoint::default(),
            state: ConnectState::None,
            local_settled_sn: 0,
            local_flushed_sn: 0,
            local_window_sn: 0,
            remote_acked_sn: 0,
            remote_known_sn: 0,
            announced_window: 0,
            recv_ring: RingBuffer::new(RING_SHIFT),
            send_ring: RingBuffer::new(RING_SHIFT),
            closed: false,
            pump_error: None,
        }
    }

    /// Bytes on the wire but not yet settled, relative to the send ring
    /// front.
    fn flush_ptr(&self) -> usize {
        self.local_flushed_sn.wrapping_sub(self.local_settled_sn) as usize
    }

    /// End of the peer-permitted window, relative to the send ring front.
    fn window_ptr(&self) -> usize {
        self.local_window_sn.wrapping_sub(self.local_settled_sn) as usize
    }

    fn wants_emission(&self) -> bool {
        let flush_ptr = self.flush_ptr();
        let available = self.send_ring.available_to_dequeue();
        debug_assert!(available >= flush_ptr);

        let want_data = available > flush_ptr && self.window_ptr() > flush_ptr;
        let want_ack = self.remote_acked_sn != self.remote_known_sn;
        let want_window_update =
            self.announced_window < self.recv_ring.space_for_enqueue() as u32;

        want_data || want_ack || want_window_update
    }
}

enum PumpStep {
    Sleep,
    Exit,
    SendSyn,
    SendData,
}

impl Tcp4Socket {
    /// Creates an unbound socket and starts its outbound pump.
    pub fn new(parent: Arc<Tcp4>) -> Self {
        let inner = Arc::new(SocketInner {
            parent,
            tcb: Mutex::new(Tcb::new()),
            in_event: Doorbell::new(),
            flush_event: Doorbell::new(),
            settle_event: Doorbell::new(),
        });

        let pump = Arc::clone(&inner);
        thread::Builder::new()
            .name("tcp4-pump".into())
            .spawn(move || pump.flush_out_packets())
            .expect("failed to spawn outbound pump");

        Self { inner }
    }

    /// Returns the bound local endpoint; port 0 means unbound.
    pub fn local_endpoint(&self) -> TcpEndpoint {
        self.inner.tcb.lock().unwrap().local_ep
    }

    /// Returns the connected remote endpoint.
    pub fn remote_endpoint(&self) -> TcpEndpoint {
        self.inner.tcb.lock().unwrap().remote_ep
    }

    /// Binds the socket to the `sockaddr_in` in `addr`.
    ///
    /// A port of 0 picks a random ephemeral port.
    ///
    /// # Errors
    ///
    /// [Error::IllegalArguments] if already bound or `addr` is malformed,
    /// [Error::AfNotSupported] for a non-`AF_INET` family,
    /// [Error::AccessDenied] for the broadcast address,
    /// [Error::AddressNotAvailable] if the stack does not serve the
    /// address, and [Error::AddressInUse] if no binding is possible.
    pub fn bind(&self, addr: &[u8]) -> Result<()> {
        if self.inner.tcb.lock().unwrap().local_ep.port != 0 {
            return Err(Error::IllegalArguments);
        }

        let bind_ep = SockaddrIn::parse(addr)?.endpoint();

        if bind_ep.ip == INADDR_BROADCAST {
            warn!("TCP cannot broadcast");
            return Err(Error::AccessDenied);
        }

        if !self.inner.parent.link().has_ip(bind_ep.ip) {
            return Err(Error::AddressNotAvailable);
        }

        if bind_ep.port == 0 {
            if !self.inner.bind_available(bind_ep.ip) {
                warn!("no source port");
                return Err(Error::AddressInUse);
            }
        } else if !self.inner.parent.try_bind(&self.inner, bind_ep) {
            return Err(Error::AddressInUse);
        }

        Ok(())
    }

    /// Actively opens a connection to the `sockaddr_in` in `addr`,
    /// blocking until the handshake completes.
    ///
    /// An unbound socket is bound to a random ephemeral port first.
    ///
    /// # Errors
    ///
    /// [Error::IllegalArguments] unless the socket is in the initial
    /// state, address errors as for [Tcp4Socket::bind],
    /// [Error::NetUnreachable] if the remote cannot be routed, and
    /// [Error::ConnectionReset] if the socket is closed mid-handshake.
    pub fn connect(&self, addr: &[u8]) -> Result<()> {
        if self.inner.tcb.lock().unwrap().state != ConnectState::None {
            return Err(Error::IllegalArguments);
        }

        let connect_ep = SockaddrIn::parse(addr)?.endpoint();

        if connect_ep.ip == INADDR_BROADCAST {
            warn!("TCP cannot broadcast");
            return Err(Error::AccessDenied);
        }

        let unbound = self.inner.tcb.lock().unwrap().local_ep.port == 0;
        if unbound && !self.inner.bind_available(INADDR_ANY) {
            warn!("no source port");
            return Err(Error::AddressNotAvailable);
        }

        {
            let mut tcb = self.inner.tcb.lock().unwrap();
            if tcb.state != ConnectState::None {
                return Err(Error::IllegalArguments);
            }
            tcb.remote_ep = connect_ep;
            tcb.state = ConnectState::SendSyn;
        }
        self.inner.flush_event.ring();

        loop {
            let seen = self.inner.settle_event.sequence();
            {
                let tcb = self.inner.tcb.lock().unwrap();
                if tcb.state != ConnectState::SendSyn {
                    break;
                }
                if let Some(error) = tcb.pump_error {
                    return Err(error);
                }
                if tcb.closed {
                    return Err(Error::ConnectionReset);
                }
            }
            self.inner.settle_event.wait_from(seen);
        }

        Ok(())
    }

    /// Receives exactly `buf.len()` bytes, blocking until they arrived.
    ///
    /// Returns the number of bytes delivered and the peer's address.
    /// Non-blocking flag bits are not honored.
    ///
    /// # Errors
    ///
    /// [Error::ConnectionReset] if the socket is closed or its pump died
    /// while the call was blocked.
    pub fn recv_msg(&self, buf: &mut [u8]) -> Result<(usize, SockaddrIn)> {
        let mut progress = 0;
        while progress < buf.len() {
            let seen = self.inner.in_event.sequence();
            let mut wait = false;
            {
                let mut tcb = self.inner.tcb.lock().unwrap();
                if tcb.closed || tcb.pump_error.is_some() {
                    return Err(Error::ConnectionReset);
                }

                let available = tcb.recv_ring.available_to_dequeue();
                if available == 0 {
                    wait = true;
                } else {
                    let chunk = usize::min(available, buf.len() - progress);
                    tcb.recv_ring.dequeue(&mut buf[progress..progress + chunk]);
                    progress += chunk;
                }
            }

            if wait {
                self.inner.in_event.wait_from(seen);
            } else {
                // Freed receive space may be worth a window update.
                self.inner.flush_event.ring();
            }
        }

        let remote = self.inner.tcb.lock().unwrap().remote_ep;
        Ok((progress, SockaddrIn::new(remote)))
    }

    /// Queues all of `buf` for transmission, blocking while the send ring
    /// is full. Always returns `buf.len()`. Non-blocking flag bits are
    /// not honored.
    ///
    /// # Errors
    ///
    /// [Error::ConnectionReset] if the socket is closed or its pump died
    /// while the call was blocked.
    pub fn send_msg(&self, buf: &[u8]) -> Result<usize> {
        let mut progress = 0;
        while progress < buf.len() {
            let seen = self.inner.settle_event.sequence();
            let mut wait = false;
            {
                let mut tcb = self.inner.tcb.lock().unwrap();
                if tcb.closed || tcb.pump_error.is_some() {
                    return Err(Error::ConnectionReset);
                }

                let space = tcb.send_ring.space_for_enqueue();
                if space == 0 {
                    wait = true;
                } else {
                    let chunk = usize::min(space, buf.len() - progress);
                    tcb.send_ring.enqueue(&buf[progress..progress + chunk]);
                    progress += chunk;
                }
            }

            if wait {
                self.inner.settle_event.wait_from(seen);
            } else {
                self.inner.flush_event.ring();
            }
        }

        Ok(buf.len())
    }

    /// Requeues everything past the settled mark for another emission
    /// pass. A retransmission timer can drive this; the core itself never
    /// arms one.
    pub fn retransmit_rewind(&self) {
        {
            let mut tcb = self.inner.tcb.lock().unwrap();
            if tcb.state != ConnectState::Connected {
                return;
            }
            tcb.local_flushed_sn = tcb.local_settled_sn;
        }
        self.inner.flush_event.ring();
    }

    /// Closes the socket: wakes every blocked operation with
    /// [Error::ConnectionReset], terminates the pump, and unbinds the
    /// local endpoint.
    pub fn close(&self) {
        let local_ep = {
            let mut tcb = self.inner.tcb.lock().unwrap();
            if tcb.closed {
                return;
            }
            tcb.closed = true;
            tcb.local_ep
        };

        self.inner.in_event.ring();
        self.inner.flush_event.ring();
        self.inner.settle_event.ring();

        if local_ep.port != 0 {
            self.inner.parent.unbind(local_ep);
        }
    }
}

impl Drop for Tcp4Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Tcp4Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tcb = self.inner.tcb.lock().unwrap();
        f.debug_struct("Tcp4Socket")
            .field("local_ep", &tcb.local_ep)
            .field("remote_ep", &tcb.remote_ep)
            .field("state", &tcb.state)
            .finish_non_exhaustive()
    }
}

impl SocketInner {
    /// Picks a random ephemeral port and tries the whole range cyclically
    /// from there.
    pub(crate) fn bind_available(self: &Arc<Self>, ip: u32) -> bool {
        let range = (EPHEMERAL_LAST - EPHEMERAL_FIRST) as u32;
        let start = rand::thread_rng().gen_range(EPHEMERAL_FIRST..=EPHEMERAL_LAST) as u32;

        for i in 0..range {
            let port = EPHEMERAL_FIRST + ((start + i) % range) as u16;
            if self
                .parent
                .try_bind(self, TcpEndpoint::new(ip, port))
            {
                return true;
            }
        }

        false
    }

    pub(crate) fn set_local_ep(&self, ep: TcpEndpoint) {
        self.tcb.lock().unwrap().local_ep = ep;
    }

    /// The outbound pump. Sleeps on the flush doorbell and emits at most
    /// one segment per wake-up.
    fn flush_out_packets(self: Arc<Self>) {
        loop {
            // Snapshot before evaluating, so a ring that arrives while we
            // decide is not lost.
            let seen = self.flush_event.sequence();

            let step = {
                let tcb = self.tcb.lock().unwrap();
                if tcb.closed {
                    PumpStep::Exit
                } else {
                    match tcb.state {
                        ConnectState::None | ConnectState::SendSynAck => PumpStep::Sleep,
                        ConnectState::SendSyn => {
                            if tcb.local_settled_sn != tcb.local_flushed_sn {
                                // The SYN is already in flight.
                                PumpStep::Sleep
                            } else {
                                PumpStep::SendSyn
                            }
                        }
                        ConnectState::Connected => {
                            if tcb.wants_emission() {
                                PumpStep::SendData
                            } else {
                                PumpStep::Sleep
                            }
                        }
                    }
                }
            };

            match step {
                PumpStep::Exit => return,
                PumpStep::Sleep => self.flush_event.wait_from(seen),
                PumpStep::SendSyn => {
                    if !self.emit_syn() {
                        return;
                    }
                }
                PumpStep::SendData => {
                    if !self.emit_data() {
                        return;
                    }
                }
            }
        }
    }

    /// Draws an ISN and emits the initial SYN. Returns `false` if the
    /// pump must terminate.
    fn emit_syn(&self) -> bool {
        let (mut header, remote_ip) = {
            let mut tcb = self.tcb.lock().unwrap();

            let isn = rand::thread_rng().gen::<u32>();
            tcb.local_settled_sn = isn;
            tcb.local_flushed_sn = isn;

            let header = TcpHeader::new(tcb.local_ep.port, tcb.remote_ep.port, isn, 0);

            // The SYN consumes one sequence number.
            tcb.local_flushed_sn = tcb.local_flushed_sn.wrapping_add(1);

            (header, tcb.remote_ep.ip)
        };
        header.set_syn();

        let Some(target) = self.parent.link().target_by_remote(remote_ip) else {
            warn!("destination unreachable");
            return self.fail_pump();
        };

        header.set_checksum(target.source, remote_ip, &[]);

        debug!("sending TCP SYN");
        if self
            .parent
            .link()
            .send_frame(&target, &header.to_be_bytes(), PROTO_TCP)
            .is_err()
        {
            warn!("could not send TCP segment");
            return self.fail_pump();
        }

        true
    }

    /// Emits one data, ACK, or window-update segment. Returns `false` if
    /// the pump must terminate.
    fn emit_data(&self) -> bool {
        let remote_ip = self.tcb.lock().unwrap().remote_ep.ip;

        let Some(target) = self.parent.link().target_by_remote(remote_ip) else {
            warn!("destination unreachable");
            return self.fail_pump();
        };

        // The routing lookup may have blocked; re-evaluate under the
        // lock so the segment reflects current counters.
        let (mut header, payload) = {
            let mut tcb = self.tcb.lock().unwrap();
            if !tcb.wants_emission() {
                return true;
            }

            let flush_ptr = tcb.flush_ptr();
            let window_ptr = tcb.window_ptr();
            let available = tcb.send_ring.available_to_dequeue();

            let chunk = if available > flush_ptr && window_ptr > flush_ptr {
                usize::min(
                    usize::min(available - flush_ptr, window_ptr - flush_ptr),
                    MTU_PAYLOAD,
                )
            } else {
                0
            };

            let mut payload = vec![0u8; chunk];
            tcb.send_ring.dequeue_lookahead(flush_ptr, &mut payload);

            let space = tcb.recv_ring.space_for_enqueue();
            let mut header = TcpHeader::new(
                tcb.local_ep.port,
                tcb.remote_ep.port,
                tcb.local_flushed_sn,
                space as u16,
            );
            header.set_ack();
            header.set_ack_number(tcb.remote_known_sn);

            tcb.local_flushed_sn = tcb.local_flushed_sn.wrapping_add(chunk as u32);
            tcb.remote_acked_sn = tcb.remote_known_sn;
            tcb.announced_window = space as u32;

            (header, payload)
        };

        header.set_checksum(target.source, remote_ip, &payload);

        let mut frame = Vec::with_capacity(TcpHeader::LEN + payload.len());
        frame.extend_from_slice(&header.to_be_bytes());
        frame.extend_from_slice(&payload);

        debug!("sending TCP data ({} bytes)", payload.len());
        if self
            .parent
            .link()
            .send_frame(&target, &frame, PROTO_TCP)
            .is_err()
        {
            warn!("could not send TCP segment");
            return self.fail_pump();
        }

        true
    }

    /// Latches the pump failure where blocked callers can see it. Always
    /// returns `false` so emit paths can tail-call it.
    fn fail_pump(&self) -> bool {
        self.tcb.lock().unwrap().pump_error = Some(Error::NetUnreachable);
        self.settle_event.ring();
        self.in_event.ring();
        false
    }

    /// Classifies one inbound segment against the connection state.
    /// Runs synchronously on the dispatcher's thread.
    pub(crate) fn handle_in_packet(&self, packet: TcpPacket) {
        let mut ring_in = false;
        let mut ring_flush = false;
        let mut ring_settle = false;

        {
            let mut tcb = self.tcb.lock().unwrap();
            match tcb.state {
                ConnectState::SendSyn => {
                    if tcb.local_settled_sn == tcb.local_flushed_sn {
                        warn!("rejecting segment before SYN is sent [send-syn]");
                        return;
                    }

                    if !packet.header.syn() {
                        warn!("rejecting segment without SYN [send-syn]");
                        return;
                    }
                    if !packet.header.ack() {
                        warn!("rejecting SYN segment without ACK [send-syn]");
                        return;
                    }

                    if packet.header.ack_number() != tcb.local_settled_sn.wrapping_add(1) {
                        warn!("rejecting segment with bad ack-number [send-syn]");
                        return;
                    }

                    tcb.local_settled_sn = tcb.local_settled_sn.wrapping_add(1);
                    tcb.local_window_sn = tcb
                        .local_settled_sn
                        .wrapping_add(packet.header.window() as u32);
                    tcb.remote_acked_sn = packet.header.seq_number();
                    // The peer's SYN consumes one sequence number.
                    tcb.remote_known_sn = packet.header.seq_number().wrapping_add(1);
                    tcb.state = ConnectState::Connected;

                    debug!("connection established: {} -> {}", tcb.local_ep, tcb.remote_ep);

                    ring_flush = true;
                    ring_settle = true;
                }
                ConnectState::Connected => {
                    if packet.header.seq_number() == tcb.remote_known_sn {
                        let payload = packet.payload();
                        // Payload beyond the ring is dropped; the peer
                        // retransmits per its own window bookkeeping.
                        let chunk =
                            usize::min(payload.len(), tcb.recv_ring.space_for_enqueue());
                        if chunk > 0 {
                            tcb.recv_ring.enqueue(&payload[..chunk]);
                            tcb.remote_known_sn = tcb.remote_known_sn.wrapping_add(chunk as u32);
                            tcb.announced_window =
                                tcb.announced_window.saturating_sub(chunk as u32);
                            ring_in = true;
                            ring_flush = true;
                        }
                    }

                    if packet.header.ack() {
                        let valid_window =
                            tcb.local_flushed_sn.wrapping_sub(tcb.local_settled_sn);
                        let ack_ptr =
                            packet.header.ack_number().wrapping_sub(tcb.local_settled_sn);

                        if ack_ptr <= valid_window {
                            tcb.local_settled_sn = tcb.local_settled_sn.wrapping_add(ack_ptr);
                            tcb.local_window_sn = tcb
                                .local_settled_sn
                                .wrapping_add(packet.header.window() as u32);
                            tcb.send_ring.dequeue_advance(ack_ptr as usize);
                            ring_settle = true;
                            // An advanced window can unblock queued data.
                            ring_flush = true;
                        } else {
                            warn!("rejecting ack-number outside of the flushed window");
                        }
                    }
                }
                ConnectState::None | ConnectState::SendSynAck => {
                    debug!("ignoring segment in {:?} state", tcb.state);
                }
            }
        }

        if ring_in {
            self.in_event.ring();
        }
        if ring_flush {
            self.flush_event.ring();
        }
        if ring_settle {
            self.settle_event.ring();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::{Ip4Link, Ip4Packet, TargetInfo};
    use std::sync::Condvar;
    use std::time::Duration;

    const LOCAL_IP: u32 = 0x7f00_0001;
    const REMOTE_IP: u32 = 0x7f00_0002;
    const REMOTE_PORT: u16 = 9000;

    const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

    /// Captures emitted frames and lets tests block until they appear.
    struct TestLink {
        ips: Vec<u32>,
        reachable: bool,
        frames: Mutex<Vec<Vec<u8>>>,
        arrived: Condvar,
    }

    impl TestLink {
        fn new(ips: Vec<u32>, reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                ips,
                reachable,
                frames: Mutex::new(Vec::new()),
                arrived: Condvar::new(),
            })
        }

        fn await_frame(&self, index: usize) -> TcpHeader {
            self.await_frame_raw(index).0
        }

        fn await_frame_raw(&self, index: usize) -> (TcpHeader, Vec<u8>) {
            let mut frames = self.frames.lock().unwrap();
            while frames.len() <= index {
                let (guard, result) = self
                    .arrived
                    .wait_timeout(frames, FRAME_TIMEOUT)
                    .unwrap();
                frames = guard;
                if result.timed_out() && frames.len() <= index {
                    panic!("timed out waiting for frame {index}");
                }
            }

            let frame = frames[index].clone();
            let header = TcpHeader::try_from(&frame[..]).unwrap();
            let payload = frame[TcpHeader::LEN..].to_vec();
            (header, payload)
        }
    }

    impl Ip4Link for TestLink {
        fn has_ip(&self, ip: u32) -> bool {
            ip == INADDR_ANY || self.ips.contains(&ip)
        }

        fn target_by_remote(&self, _remote_ip: u32) -> Option<TargetInfo> {
            if !self.reachable {
                return None;
            }
            Some(TargetInfo {
                source: self.ips.first().copied().unwrap_or(LOCAL_IP),
                link: 0,
            })
        }

        fn send_frame(&self, _target: &TargetInfo, frame: &[u8], proto: u8) -> Result<()> {
            assert_eq!(proto, PROTO_TCP);
            self.frames.lock().unwrap().push(frame.to_vec());
            self.arrived.notify_all();
            Ok(())
        }
    }

    fn sockaddr(ip: u32, port: u16) -> Vec<u8> {
        SockaddrIn::new(TcpEndpoint::new(ip, port)).to_bytes().to_vec()
    }

    /// Builds an inbound segment as the remote peer would emit it.
    fn inbound(
        local_port: u16,
        seq: u32,
        ack: Option<u32>,
        window: u16,
        syn: bool,
        payload: &[u8],
    ) -> Ip4Packet {
        let mut header = TcpHeader::new(REMOTE_PORT, local_port, seq, window);
        if syn {
            header.set_syn();
        }
        if let Some(ack) = ack {
            header.set_ack();
            header.set_ack_number(ack);
        }
        header.set_checksum(REMOTE_IP, LOCAL_IP, payload);

        let mut bytes = header.to_be_bytes().to_vec();
        bytes.extend_from_slice(payload);

        Ip4Packet {
            src: REMOTE_IP,
            dst: LOCAL_IP,
            payload: bytes,
        }
    }

    /// Runs an active open against an injected peer with the given
    /// window. Returns the socket, our ISN, and the peer's ISN.
    fn establish(
        link: &Arc<TestLink>,
        tcp: &Arc<Tcp4>,
        peer_window: u16,
    ) -> (Arc<Tcp4Socket>, u32, u32) {
        let socket = Arc::new(Tcp4Socket::new(Arc::clone(tcp)));
        socket.bind(&sockaddr(LOCAL_IP, 0)).unwrap();
        let local_port = socket.local_endpoint().port;

        let connector = {
            let socket = Arc::clone(&socket);
            thread::spawn(move || socket.connect(&sockaddr(REMOTE_IP, REMOTE_PORT)))
        };

        let syn = link.await_frame(0);
        let isn = syn.seq_number();

        let peer_isn = 0x5151_0000u32;
        tcp.feed_datagram(&inbound(
            local_port,
            peer_isn,
            Some(isn.wrapping_add(1)),
            peer_window,
            true,
            &[],
        ));

        connector.join().unwrap().unwrap();

        // The pump's first connected wake acknowledges the peer's SYN.
        let ack = link.await_frame(1);
        assert!(ack.ack());
        assert_eq!(ack.ack_number(), peer_isn.wrapping_add(1));

        (socket, isn, peer_isn)
    }

    #[test]
    fn bind_assigns_an_ephemeral_port() {
        let link = TestLink::new(vec![LOCAL_IP], true);
        let tcp = Tcp4::new(link);

        let socket = Tcp4Socket::new(Arc::clone(&tcp));
        socket.bind(&sockaddr(LOCAL_IP, 0)).unwrap();

        let port = socket.local_endpoint().port;
        assert!((EPHEMERAL_FIRST..=EPHEMERAL_LAST).contains(&port));
        assert_eq!(socket.local_endpoint().ip, LOCAL_IP);
    }

    #[test]
    fn bind_validates_the_address() {
        let link = TestLink::new(vec![LOCAL_IP], true);
        let tcp = Tcp4::new(link);
        let socket = Tcp4Socket::new(Arc::clone(&tcp));

        // Short buffer.
        assert_eq!(
            socket.bind(&sockaddr(LOCAL_IP, 80)[..8]),
            Err(Error::IllegalArguments)
        );

        // Wrong family.
        let mut addr = sockaddr(LOCAL_IP, 80);
        addr[0..2].copy_from_slice(&10u16.to_ne_bytes());
        assert_eq!(socket.bind(&addr), Err(Error::AfNotSupported));

        // Broadcast.
        assert_eq!(
            socket.bind(&sockaddr(INADDR_BROADCAST, 80)),
            Err(Error::AccessDenied)
        );

        // Not a local address.
        assert_eq!(
            socket.bind(&sockaddr(0x0808_0808, 80)),
            Err(Error::AddressNotAvailable)
        );

        // Binding twice.
        socket.bind(&sockaddr(LOCAL_IP, 8080)).unwrap();
        assert_eq!(
            socket.bind(&sockaddr(LOCAL_IP, 8081)),
            Err(Error::IllegalArguments)
        );
    }

    #[test]
    fn connect_performs_active_open() {
        let link = TestLink::new(vec![LOCAL_IP], true);
        let tcp = Tcp4::new(Arc::clone(&link) as Arc<dyn Ip4Link>);

        let socket = Arc::new(Tcp4Socket::new(Arc::clone(&tcp)));
        socket.bind(&sockaddr(LOCAL_IP, 0)).unwrap();
        let local_port = socket.local_endpoint().port;
        assert!((EPHEMERAL_FIRST..=EPHEMERAL_LAST).contains(&local_port));

        let connector = {
            let socket = Arc::clone(&socket);
            thread::spawn(move || socket.connect(&sockaddr(REMOTE_IP, REMOTE_PORT)))
        };

        let syn = link.await_frame(0);
        assert!(syn.syn());
        assert!(!syn.ack());
        assert_eq!(syn.header_words(), 5);
        assert_eq!(syn.src_port(), local_port);
        assert_eq!(syn.dst_port(), REMOTE_PORT);
        assert_eq!(syn.ack_number(), 0);
        assert_eq!(syn.window(), 0);
        let isn = syn.seq_number();

        let peer_isn = 0xCAFE_0000u32;
        tcp.feed_datagram(&inbound(
            local_port,
            peer_isn,
            Some(isn.wrapping_add(1)),
            4096,
            true,
            &[],
        ));

        connector.join().unwrap().unwrap();
        assert_eq!(
            socket.inner.tcb.lock().unwrap().state,
            ConnectState::Connected
        );
        assert_eq!(
            socket.inner.tcb.lock().unwrap().remote_known_sn,
            peer_isn.wrapping_add(1)
        );

        // The next wake emits a pure ACK for the peer's SYN.
        let ack = link.await_frame(1);
        assert!(ack.ack());
        assert!(!ack.syn());
        assert_eq!(ack.seq_number(), isn.wrapping_add(1));
        assert_eq!(ack.ack_number(), peer_isn.wrapping_add(1));

        // A second connect is rejected.
        assert_eq!(
            socket.connect(&sockaddr(REMOTE_IP, REMOTE_PORT)),
            Err(Error::IllegalArguments)
        );
    }

    #[test]
    fn handshake_rejects_bad_ack_numbers() {
        let link = TestLink::new(vec![LOCAL_IP], true);
        let tcp = Tcp4::new(Arc::clone(&link) as Arc<dyn Ip4Link>);

        let socket = Arc::new(Tcp4Socket::new(Arc::clone(&tcp)));
        socket.bind(&sockaddr(LOCAL_IP, 0)).unwrap();
        let local_port = socket.local_endpoint().port;

        let connector = {
            let socket = Arc::clone(&socket);
            thread::spawn(move || socket.connect(&sockaddr(REMOTE_IP, REMOTE_PORT)))
        };

        let isn = link.await_frame(0).seq_number();

        // Wrong acknowledgment number: must be ignored.
        tcp.feed_datagram(&inbound(
            local_port,
            1,
            Some(isn.wrapping_add(2)),
            4096,
            true,
            &[],
        ));
        // SYN without ACK: must be ignored.
        tcp.feed_datagram(&inbound(local_port, 1, None, 4096, true, &[]));

        assert_eq!(
            socket.inner.tcb.lock().unwrap().state,
            ConnectState::SendSyn
        );

        // The correct SYN+ACK still succeeds afterwards.
        tcp.feed_datagram(&inbound(
            local_port,
            7,
            Some(isn.wrapping_add(1)),
            4096,
            true,
            &[],
        ));
        connector.join().unwrap().unwrap();
    }

    #[test]
    fn pump_respects_the_peer_window() {
        let link = TestLink::new(vec![LOCAL_IP], true);
        let tcp = Tcp4::new(Arc::clone(&link) as Arc<dyn Ip4Link>);
        let (socket, isn, peer_isn) = establish(&link, &tcp, 100);
        let local_port = socket.local_endpoint().port;

        let sent = socket.send_msg(&[b'A'; 250]).unwrap();
        assert_eq!(sent, 250);

        // First segment: capped by the 100-byte peer window.
        let (data, payload) = link.await_frame_raw(2);
        assert_eq!(data.seq_number(), isn.wrapping_add(1));
        assert_eq!(payload.len(), 100);
        assert!(payload.iter().all(|&b| b == b'A'));

        // The window is exhausted until the peer acknowledges.
        tcp.feed_datagram(&inbound(
            local_port,
            peer_isn.wrapping_add(1),
            Some(isn.wrapping_add(101)),
            100,
            false,
            &[],
        ));

        let (data, payload) = link.await_frame_raw(3);
        assert_eq!(data.seq_number(), isn.wrapping_add(101));
        assert_eq!(payload.len(), 100);

        tcp.feed_datagram(&inbound(
            local_port,
            peer_isn.wrapping_add(1),
            Some(isn.wrapping_add(201)),
            100,
            false,
            &[],
        ));

        let (data, payload) = link.await_frame_raw(4);
        assert_eq!(data.seq_number(), isn.wrapping_add(201));
        assert_eq!(payload.len(), 50);

        // Sequence invariant: settled <= flushed <= window.
        let tcb = socket.inner.tcb.lock().unwrap();
        let flushed = tcb.local_flushed_sn.wrapping_sub(tcb.local_settled_sn);
        let window = tcb.local_window_sn.wrapping_sub(tcb.local_settled_sn);
        assert!(flushed <= window);
    }

    #[test]
    fn inbound_data_reaches_recv_msg_and_is_acked() {
        let link = TestLink::new(vec![LOCAL_IP], true);
        let tcp = Tcp4::new(Arc::clone(&link) as Arc<dyn Ip4Link>);
        let (socket, isn, peer_isn) = establish(&link, &tcp, 4096);
        let local_port = socket.local_endpoint().port;

        tcp.feed_datagram(&inbound(
            local_port,
            peer_isn.wrapping_add(1),
            Some(isn.wrapping_add(1)),
            4096,
            false,
            b"hello",
        ));

        let mut buf = [0u8; 5];
        let (len, addr) = socket.recv_msg(&mut buf).unwrap();
        assert_eq!(len, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(addr.endpoint(), TcpEndpoint::new(REMOTE_IP, REMOTE_PORT));

        // The pump acknowledges the delivered bytes.
        let ack = link.await_frame(2);
        assert!(ack.ack());
        assert_eq!(ack.ack_number(), peer_isn.wrapping_add(6));
    }

    #[test]
    fn out_of_window_acks_are_rejected_silently() {
        let link = TestLink::new(vec![LOCAL_IP], true);
        let tcp = Tcp4::new(Arc::clone(&link) as Arc<dyn Ip4Link>);
        let (socket, isn, peer_isn) = establish(&link, &tcp, 100);
        let local_port = socket.local_endpoint().port;

        let settled_before = socket.inner.tcb.lock().unwrap().local_settled_sn;
        let settle_seen = socket.inner.settle_event.sequence();

        // Acknowledges bytes that were never flushed.
        tcp.feed_datagram(&inbound(
            local_port,
            peer_isn.wrapping_add(1),
            Some(isn.wrapping_add(5000)),
            100,
            false,
            &[],
        ));

        let tcb = socket.inner.tcb.lock().unwrap();
        assert_eq!(tcb.local_settled_sn, settled_before);
        drop(tcb);
        // No doorbell fired.
        assert_eq!(socket.inner.settle_event.sequence(), settle_seen);
    }

    #[test]
    fn overflowing_payload_is_truncated_to_ring_space() {
        let link = TestLink::new(vec![LOCAL_IP], true);
        let tcp = Tcp4::new(Arc::clone(&link) as Arc<dyn Ip4Link>);
        let (socket, isn, peer_isn) = establish(&link, &tcp, 4096);
        let local_port = socket.local_endpoint().port;

        // Twice the ring capacity; only the first ring-full fits.
        let capacity = socket
            .inner
            .tcb
            .lock()
            .unwrap()
            .recv_ring
            .capacity();
        let oversized = vec![0x42u8; capacity * 2];
        tcp.feed_datagram(&inbound(
            local_port,
            peer_isn.wrapping_add(1),
            Some(isn.wrapping_add(1)),
            4096,
            false,
            &oversized,
        ));

        let tcb = socket.inner.tcb.lock().unwrap();
        assert_eq!(tcb.recv_ring.available_to_dequeue(), capacity);
        assert_eq!(
            tcb.remote_known_sn,
            peer_isn.wrapping_add(1).wrapping_add(capacity as u32)
        );
    }

    #[test]
    fn unroutable_connect_reports_net_unreachable() {
        let link = TestLink::new(vec![LOCAL_IP], false);
        let tcp = Tcp4::new(link);

        let socket = Tcp4Socket::new(Arc::clone(&tcp));
        assert_eq!(
            socket.connect(&sockaddr(REMOTE_IP, REMOTE_PORT)),
            Err(Error::NetUnreachable)
        );
    }

    #[test]
    fn close_wakes_blocked_receivers() {
        let link = TestLink::new(vec![LOCAL_IP], true);
        let tcp = Tcp4::new(link);

        let socket = Arc::new(Tcp4Socket::new(Arc::clone(&tcp)));
        let receiver = {
            let socket = Arc::clone(&socket);
            thread::spawn(move || {
                let mut buf = [0u8; 4];
                socket.recv_msg(&mut buf)
            })
        };

        thread::sleep(Duration::from_millis(50));
        socket.close();

        assert_eq!(receiver.join().unwrap(), Err(Error::ConnectionReset));
    }

    #[test]
    fn retransmit_rewind_replays_unsettled_bytes() {
        let link = TestLink::new(vec![LOCAL_IP], true);
        let tcp = Tcp4::new(Arc::clone(&link) as Arc<dyn Ip4Link>);
        let (socket, isn, _peer_isn) = establish(&link, &tcp, 4096);

        socket.send_msg(b"replay me").unwrap();

        let (first, payload) = link.await_frame_raw(2);
        assert_eq!(first.seq_number(), isn.wrapping_add(1));
        assert_eq!(payload, b"replay me");

        // No ACK arrived; rewind and the same bytes go out again.
        socket.retransmit_rewind();

        let (second, payload) = link.await_frame_raw(3);
        assert_eq!(second.seq_number(), isn.wrapping_add(1));
        assert_eq!(payload, b"replay me");
    }
}
