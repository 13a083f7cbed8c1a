// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! The connection-routing worker.
//!
//! A [`RoutingWorker`] owns one UDP socket and the routing tables for every
//! connection behind it. It classifies each inbound datagram, routes it to
//! an existing connection or creates one, answers unroutable traffic with
//! stateless resets and version negotiation, and participates in the
//! takeover handoff with a sibling process.
//!
//! The worker is a [`Future`]: spawn it on one task and drive everything
//! else through [`WorkerHandle`] and [`ConnectionControl`] messages. All
//! routing state lives on that task; there is no locking anywhere.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use foundations::telemetry::log;
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use quix::cid::ROUTABLE_CID_LEN;
use quix::packet;
use quix::ConnectionId;
use quix::RoutingInfo;

use crate::connection::CidKey;
use crate::connection::CloseReason;
use crate::connection::Command;
use crate::connection::ConnEvent;
use crate::connection::ConnectionControl;
use crate::connection::ConnectionMap;
use crate::connection::Incoming;
use crate::connection::TransportFactory;
use crate::metrics::labels::DropReason;
use crate::metrics::Metrics;
use crate::settings::WorkerSettings;
use crate::takeover;

/// Reply sent for health check probes.
const HEALTH_CHECK_REPLY: &[u8] = b"OK";

struct Forwarder {
    socket: UdpSocket,
    sibling: SocketAddr,

    /// When set, forwarding stops once this deadline passes.
    drain_until: Option<Instant>,
}

/// Control surface of a spawned [`RoutingWorker`].
///
/// All operations are fire-and-forget messages onto the worker's loop.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    cmds: mpsc::UnboundedSender<Command>,
}

impl WorkerHandle {
    /// Marks the worker as shutting down and closes every live connection
    /// with `reason`. Subsequent datagrams are dropped. Idempotent.
    pub fn shutdown_all_connections(&self, reason: CloseReason) {
        let _ = self.cmds.send(Command::Shutdown { reason });
    }

    /// Starts wrapping unroutable datagrams that belong to the sibling
    /// process and relaying them to `sibling`.
    pub fn start_packet_forwarding(&self, sibling: SocketAddr) {
        let _ = self.cmds.send(Command::StartForwarding { sibling });
    }

    /// Keeps forwarding for up to `drain`, then closes the forward socket.
    pub fn stop_packet_forwarding(&self, drain: Duration) {
        let _ = self.cmds.send(Command::StopForwarding { drain });
    }
}

/// A connection-routing worker bound to one UDP socket.
pub struct RoutingWorker<F, M> {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,

    settings: WorkerSettings,

    conns: ConnectionMap,
    next_conn_id: u64,

    factory: F,
    metrics: M,

    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,

    shutting_down: bool,

    forwarder: Option<Forwarder>,

    /// Socket this worker receives sibling-forwarded datagrams on, when it
    /// has allowed itself to be taken over.
    takeover_socket: Option<Arc<UdpSocket>>,

    recv_buf: Vec<u8>,
}

impl<F, M> RoutingWorker<F, M>
where
    F: TransportFactory,
    M: Metrics,
{
    pub fn new(
        socket: Arc<UdpSocket>, settings: WorkerSettings, factory: F,
        metrics: M,
    ) -> io::Result<(Self, WorkerHandle)> {
        let local_addr = socket.local_addr()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let handle = WorkerHandle {
            cmds: cmd_tx.clone(),
        };

        let worker = RoutingWorker {
            socket,
            local_addr,
            settings,
            conns: ConnectionMap::default(),
            next_conn_id: 0,
            factory,
            metrics,
            cmd_tx,
            cmd_rx,
            shutting_down: false,
            forwarder: None,
            takeover_socket: None,
            recv_buf: vec![0; u16::MAX as usize],
        };

        Ok((worker, handle))
    }

    /// The address of the worker's UDP socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Attaches the socket on which the sibling process will relay this
    /// worker's datagrams during takeover.
    pub fn allow_takeover(&mut self, socket: Arc<UdpSocket>) {
        self.takeover_socket = Some(socket);
    }

    /// Routes one inbound datagram, recording a drop reason if it is not
    /// delivered.
    fn handle_datagram(
        &mut self, peer: SocketAddr, buf: Vec<u8>,
        rx_time: Option<SystemTime>, forwarded: bool,
    ) {
        if let Some(reason) = self.route_datagram(peer, buf, rx_time, forwarded)
        {
            log::trace!("datagram dropped"; "peer" => %peer, "reason" => %reason);
            self.metrics.dropped_datagram_count(reason).inc();
        }
    }

    /// The routing decision for one datagram.
    ///
    /// Returns `None` when the datagram was delivered (to a connection, the
    /// sibling, or a probe reply) and the reason otherwise. Every
    /// non-delivery path maps to exactly one reason.
    fn route_datagram(
        &mut self, peer: SocketAddr, buf: Vec<u8>,
        rx_time: Option<SystemTime>, forwarded: bool,
    ) -> Option<DropReason> {
        if self.shutting_down {
            return Some(DropReason::ServerShutdown);
        }

        if let Some(token) = &self.settings.health_check_token {
            if buf == *token {
                let _ = self.socket.try_send_to(HEALTH_CHECK_REPLY, peer);
                self.metrics.health_check_count().inc();
                return None;
            }
        }

        let Some(&first) = buf.first() else {
            return Some(DropReason::InvalidPacket);
        };

        if !packet::header_form_is_long(first) {
            let Some(dcid) = packet::short_dcid(&buf, ROUTABLE_CID_LEN) else {
                return Some(DropReason::InvalidPacket);
            };

            let dcid = ConnectionId::from_vec(dcid.to_vec());
            let key = CidKey::from(&dcid);

            if let Some(entry) = self.conns.get_by_cid(&key) {
                let tx = entry.tx.clone();
                return deliver(&tx, Incoming {
                    peer_addr: peer,
                    buf,
                    rx_time,
                    forwarded,
                });
            }

            if self.conns.is_rejected(&key, Instant::now()) {
                return Some(DropReason::RejectedCid);
            }

            return self.route_unmatched(
                peer,
                dcid,
                packet::Type::Short,
                buf,
                rx_time,
                forwarded,
            );
        }

        let parsed =
            match packet::parse_header(&buf, ROUTABLE_CID_LEN, true) {
                Ok(v) => v,

                Err(e) => {
                    log::trace!("failed to parse header"; "peer" => %peer, "error" => %e);
                    return Some(DropReason::InvalidPacket);
                },
            };

        let hdr = parsed.hdr;

        // Servers never consume these; a peer sending them is confused.
        if matches!(
            hdr.ty,
            packet::Type::VersionNegotiation | packet::Type::Retry
        ) {
            return Some(DropReason::InvalidPacket);
        }

        if !quix::version_is_supported(hdr.version) {
            self.send_version_negotiation(&hdr, peer);
            return Some(DropReason::UnsupportedVersion);
        }

        let ty = hdr.ty;
        let key = CidKey::from(&hdr.dcid);

        // Handshake-time packets route by source identity, until the peer
        // has picked up a server-chosen CID.
        if let Some(entry) = self.conns.get_by_src(peer, &key) {
            let tx = entry.tx.clone();
            return deliver(&tx, Incoming {
                peer_addr: peer,
                buf,
                rx_time,
                forwarded,
            });
        }

        if let Some(entry) = self.conns.get_by_cid(&key) {
            let tx = entry.tx.clone();
            return deliver(&tx, Incoming {
                peer_addr: peer,
                buf,
                rx_time,
                forwarded,
            });
        }

        if self.conns.is_rejected(&key, Instant::now()) {
            return Some(DropReason::RejectedCid);
        }

        if ty == packet::Type::Initial {
            if buf.len() < quix::MIN_CLIENT_INITIAL_LEN {
                return Some(DropReason::InvalidPacket);
            }

            if self.settings.reject_new_connections {
                return Some(DropReason::CannotMakeTransport);
            }

            let conn = self.next_conn_id;
            let control = ConnectionControl {
                conn,
                cmds: self.cmd_tx.clone(),
            };

            let tx = match self.factory.make_transport(peer, &hdr, control) {
                Ok(tx) => tx,

                Err(e) => {
                    log::debug!("transport factory refused connection"; "peer" => %peer, "error" => %e);
                    return Some(DropReason::CannotMakeTransport);
                },
            };

            self.next_conn_id += 1;
            self.conns.insert_initial(conn, peer, key, tx.clone());
            self.metrics.accepted_initial_packet_count().inc();

            log::debug!(
                "new connection";
                "peer" => %peer,
                "conn" => conn,
                "worker" => self.settings.worker_id
            );

            return deliver(&tx, Incoming {
                peer_addr: peer,
                buf,
                rx_time,
                forwarded,
            });
        }

        let dcid = hdr.dcid.clone().into_owned();
        self.route_unmatched(peer, dcid, ty, buf, rx_time, forwarded)
    }

    /// Handles a datagram no routing entry matched: hand it to the takeover
    /// sibling, or answer with a stateless reset and drop it.
    fn route_unmatched(
        &mut self, peer: SocketAddr, dcid: ConnectionId<'static>,
        ty: packet::Type, buf: Vec<u8>, rx_time: Option<SystemTime>,
        forwarded: bool,
    ) -> Option<DropReason> {
        let info = RoutingInfo::from_cid(&dcid);

        if let Ok(info) = info {
            // A fresh connection has to land on whichever process owns its
            // CID, which an Initial does not have yet; forwarded datagrams
            // are never relayed a second time.
            if !forwarded &&
                ty != packet::Type::Initial &&
                info.process_id != self.settings.process_id &&
                self.forwarding_active()
            {
                return self.forward_to_sibling(peer, &buf, rx_time);
            }

            if info.host_id != self.settings.host_id {
                if ty == packet::Type::Short {
                    self.send_stateless_reset(&dcid, peer);
                }

                return Some(DropReason::RoutingErrorWrongHost);
            }
        }

        if ty == packet::Type::Short {
            self.send_stateless_reset(&dcid, peer);
        }

        Some(DropReason::ConnectionNotFound)
    }

    fn forwarding_active(&mut self) -> bool {
        match &self.forwarder {
            Some(fwd) => match fwd.drain_until {
                Some(until) if Instant::now() >= until => {
                    log::info!("takeover forwarding drained");
                    self.forwarder = None;
                    false
                },

                _ => true,
            },

            None => false,
        }
    }

    fn forward_to_sibling(
        &self, peer: SocketAddr, buf: &[u8], rx_time: Option<SystemTime>,
    ) -> Option<DropReason> {
        let Some(fwd) = &self.forwarder else {
            return Some(DropReason::ForwardFailed);
        };

        let rx_time = rx_time.unwrap_or_else(SystemTime::now);
        let wrapped = takeover::encode(peer, rx_time, buf);

        match fwd.socket.try_send_to(&wrapped, fwd.sibling) {
            Ok(_) => {
                self.metrics.forwarded_packet_count().inc();
                None
            },

            Err(e) => {
                log::debug!("takeover forward failed"; "error" => %e);
                Some(DropReason::ForwardFailed)
            },
        }
    }

    /// Unwraps a datagram relayed by the sibling and routes it as if it had
    /// arrived from the original peer.
    fn on_takeover_datagram(&mut self, buf: &[u8]) {
        match takeover::decode(buf) {
            Ok(fwd) => {
                self.metrics.forwarded_packet_received_count().inc();

                let peer = fwd.peer_addr;
                let rx_time = fwd.rx_time;
                let datagram = fwd.datagram.to_vec();

                self.handle_datagram(peer, datagram, Some(rx_time), true);
            },

            Err(e) => {
                log::debug!("invalid takeover envelope"; "error" => %e);
                self.metrics
                    .dropped_datagram_count(DropReason::InvalidPacket)
                    .inc();
            },
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::MapCid { conn, cid } => {
                self.conns.map_cid(conn, CidKey::from(&cid));
            },

            Command::CidBound { conn } => {
                self.conns.cid_bound(conn);
            },

            Command::RetireCid { conn, cid } => {
                let until = Instant::now() +
                    self.settings.rejected_cid_grace.unwrap_or_default();
                self.conns.retire_cid(conn, &CidKey::from(&cid), until);
            },

            Command::Unbind { conn, retired } => {
                let until = Instant::now() +
                    self.settings.rejected_cid_grace.unwrap_or_default();
                let retired =
                    retired.iter().map(CidKey::from).collect::<Vec<_>>();
                self.conns.unbind(conn, retired, until);
            },

            Command::Shutdown { reason } => {
                self.shutdown(reason);
            },

            Command::StartForwarding { sibling } => {
                if let Err(e) = self.start_forwarding(sibling) {
                    log::error!("failed to open takeover forward socket"; "error" => %e);
                }
            },

            Command::StopForwarding { drain } => {
                if drain.is_zero() {
                    self.forwarder = None;
                } else if let Some(fwd) = &mut self.forwarder {
                    fwd.drain_until = Some(Instant::now() + drain);
                }
            },
        }
    }

    fn start_forwarding(&mut self, sibling: SocketAddr) -> io::Result<()> {
        let bind: SocketAddr = if sibling.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };

        let socket = std::net::UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;

        self.forwarder = Some(Forwarder {
            socket: UdpSocket::from_std(socket)?,
            sibling,
            drain_until: None,
        });

        log::info!("takeover forwarding enabled"; "sibling" => %sibling);

        Ok(())
    }

    fn shutdown(&mut self, reason: CloseReason) {
        if self.shutting_down {
            return;
        }

        self.shutting_down = true;

        log::info!("closing all connections"; "connections" => self.conns.len());

        for tx in self.conns.drain() {
            let _ = tx.try_send(ConnEvent::Shutdown(reason.clone()));
        }
    }

    #[cfg(test)]
    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.handle_command(cmd);
        }
    }

    fn send_version_negotiation(
        &self, hdr: &quix::Header<'_>, peer: SocketAddr,
    ) {
        let mut out = vec![0; usize::from(self.settings.max_udp_payload)];

        match packet::negotiate_version(
            &hdr.scid,
            &hdr.dcid,
            &self.settings.supported_versions,
            &mut out,
        ) {
            Ok(len) => {
                let _ = self.socket.try_send_to(&out[..len], peer);
                self.metrics.version_negotiation_count().inc();
            },

            Err(e) => {
                log::warn!("failed to build version negotiation packet"; "error" => %e);
            },
        }
    }

    fn send_stateless_reset(&self, dcid: &ConnectionId<'_>, peer: SocketAddr) {
        let Some(secret) = &self.settings.stateless_reset_secret else {
            return;
        };

        let token = quix::token::reset_token(secret, dcid);
        let mut out = vec![0; usize::from(self.settings.max_udp_payload)];
        let max = out.len();

        match packet::stateless_reset(&token, max, &mut out) {
            Ok(len) => {
                let _ = self.socket.try_send_to(&out[..len], peer);
                self.metrics.stateless_reset_count().inc();
            },

            Err(e) => {
                log::warn!("failed to build stateless reset"; "error" => %e);
            },
        }
    }
}

fn deliver(
    tx: &mpsc::Sender<ConnEvent>, incoming: Incoming,
) -> Option<DropReason> {
    match tx.try_send(ConnEvent::Datagram(incoming)) {
        Ok(()) => None,
        Err(_) => Some(DropReason::ConnectionBusy),
    }
}

impl<F, M> Future for RoutingWorker<F, M>
where
    F: TransportFactory + Unpin,
    M: Metrics,
{
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();

        loop {
            // Lifecycle and control messages first, so routing table updates
            // order before the datagrams that depend on them.
            while let Poll::Ready(Some(cmd)) = me.cmd_rx.poll_recv(cx) {
                me.handle_command(cmd);
            }

            if let Some(takeover_socket) = me.takeover_socket.clone() {
                let mut buf = ReadBuf::new(&mut me.recv_buf);

                match takeover_socket.poll_recv_from(cx, &mut buf) {
                    Poll::Ready(Ok(_sibling)) => {
                        let data = buf.filled().to_vec();
                        me.on_takeover_datagram(&data);
                        continue;
                    },

                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),

                    Poll::Pending => (),
                }
            }

            let socket = me.socket.clone();
            let mut buf = ReadBuf::new(&mut me.recv_buf);

            match socket.poll_recv_from(cx, &mut buf) {
                Poll::Ready(Ok(peer)) => {
                    let data = buf.filled().to_vec();
                    me.handle_datagram(
                        peer,
                        data,
                        Some(SystemTime::now()),
                        false,
                    );
                },

                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),

                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::metrics::DefaultMetrics;

    struct CreatedConn {
        peer: SocketAddr,
        dcid: Vec<u8>,
        control: ConnectionControl,
        rx: mpsc::Receiver<ConnEvent>,
    }

    struct TestFactory {
        created: Arc<Mutex<Vec<CreatedConn>>>,
        refuse: bool,
    }

    impl TransportFactory for TestFactory {
        fn make_transport(
            &mut self, peer_addr: SocketAddr, hdr: &quix::Header<'_>,
            control: ConnectionControl,
        ) -> io::Result<mpsc::Sender<ConnEvent>> {
            if self.refuse {
                return Err(io::Error::other("load shed"));
            }

            let (tx, rx) = mpsc::channel(16);

            self.created.lock().unwrap().push(CreatedConn {
                peer: peer_addr,
                dcid: hdr.dcid.to_vec(),
                control,
                rx,
            });

            Ok(tx)
        }
    }

    type TestWorker = RoutingWorker<TestFactory, DefaultMetrics>;

    const SECRET: [u8; 32] = [0x5e; 32];

    fn settings() -> WorkerSettings {
        WorkerSettings {
            host_id: 5,
            process_id: 0,
            stateless_reset_secret: Some(SECRET.to_vec()),
            ..Default::default()
        }
    }

    async fn worker_with(
        settings: WorkerSettings,
    ) -> (TestWorker, WorkerHandle, Arc<Mutex<Vec<CreatedConn>>>) {
        let socket =
            Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let created = Arc::new(Mutex::new(Vec::new()));
        let factory = TestFactory {
            created: Arc::clone(&created),
            refuse: false,
        };

        let (worker, handle) =
            RoutingWorker::new(socket, settings, factory, DefaultMetrics)
                .unwrap();

        (worker, handle, created)
    }

    async fn client() -> (Arc<UdpSocket>, SocketAddr) {
        let socket =
            Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    async fn recv(socket: &UdpSocket) -> Vec<u8> {
        let mut buf = vec![0; 2048];

        let (len, _) = tokio::time::timeout(
            Duration::from_secs(5),
            socket.recv_from(&mut buf),
        )
        .await
        .expect("no datagram received")
        .unwrap();

        buf.truncate(len);
        buf
    }

    /// A long header datagram padded with zero bytes to `total` bytes, with
    /// a correct length field.
    fn long_datagram(
        ty: packet::Type, version: u32, dcid: &[u8], scid: &[u8], total: usize,
    ) -> Vec<u8> {
        let hdr = quix::Header {
            ty,
            version,
            dcid: ConnectionId::from_vec(dcid.to_vec()),
            scid: ConnectionId::from_vec(scid.to_vec()),
            token: (ty == packet::Type::Initial).then(Vec::new),
            versions: None,
            key_phase: false,
        };

        let mut out = vec![0; total];

        let mut b = octets::OctetsMut::with_slice(&mut out);
        hdr.to_bytes(1, &mut b).unwrap();

        let payload_len = total - b.off() - 2;
        b.put_varint_with_len(payload_len as u64, 2).unwrap();

        out
    }

    fn short_datagram(dcid: &[u8], body: &[u8]) -> Vec<u8> {
        let mut out = vec![0x40];
        out.extend_from_slice(dcid);
        out.extend_from_slice(body);
        out
    }

    fn our_cid(process_id: u8, host_id: u16) -> ConnectionId<'static> {
        RoutingInfo {
            process_id,
            worker_id: 0,
            host_id,
        }
        .generate_cid()
    }

    fn recv_datagram(conn: &mut CreatedConn) -> Incoming {
        match conn.rx.try_recv().expect("nothing delivered") {
            ConnEvent::Datagram(incoming) => incoming,
            ev => panic!("unexpected event: {ev:?}"),
        }
    }

    #[tokio::test]
    async fn initial_too_small() {
        let (mut worker, _handle, created) = worker_with(settings()).await;
        let (_client, peer) = client().await;

        let dgram = long_datagram(
            packet::Type::Initial,
            quix::PROTOCOL_VERSION,
            &[0x01; 8],
            &[0x02; 4],
            100,
        );

        assert_eq!(
            worker.route_datagram(peer, dgram, None, false),
            Some(DropReason::InvalidPacket)
        );

        assert!(created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn valid_initial_creates_connection() {
        let (mut worker, _handle, created) = worker_with(settings()).await;
        let (_client, peer) = client().await;

        let dgram = long_datagram(
            packet::Type::Initial,
            quix::PROTOCOL_VERSION,
            &[0x01; 8],
            &[0x02; 4],
            1200,
        );

        assert_eq!(
            worker.route_datagram(peer, dgram.clone(), None, false),
            None
        );

        let mut conns = created.lock().unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].peer, peer);
        assert_eq!(conns[0].dcid, [0x01; 8]);

        // The triggering datagram arrives unmodified.
        let incoming = recv_datagram(&mut conns[0]);
        assert_eq!(incoming.buf, dgram);
        assert_eq!(incoming.peer_addr, peer);
        assert!(!incoming.forwarded);

        drop(conns);

        // A followup from the same source identity routes to the same
        // connection instead of creating another one.
        let followup = long_datagram(
            packet::Type::Handshake,
            quix::PROTOCOL_VERSION,
            &[0x01; 8],
            &[0x02; 4],
            64,
        );

        assert_eq!(worker.route_datagram(peer, followup, None, false), None);

        let mut conns = created.lock().unwrap();
        assert_eq!(conns.len(), 1);
        let _ = recv_datagram(&mut conns[0]);
    }

    #[tokio::test]
    async fn short_header_wrong_host_resets() {
        let (mut worker, _handle, _created) = worker_with(settings()).await;
        let (client, peer) = client().await;

        // A CID naming the host next door.
        let cid = our_cid(0, 6);
        let dgram = short_datagram(&cid, &[0xab; 32]);

        assert_eq!(
            worker.route_datagram(peer, dgram, None, false),
            Some(DropReason::RoutingErrorWrongHost)
        );

        let reset = recv(&client).await;

        assert!(reset.len() <= 1350);
        assert_eq!(reset[0] & 0xc0, 0x40);
        assert_eq!(
            &reset[reset.len() - 16..],
            &quix::token::reset_token(&SECRET, &cid)
        );
    }

    #[tokio::test]
    async fn unknown_cid_resets() {
        let (mut worker, _handle, _created) = worker_with(settings()).await;
        let (client, peer) = client().await;

        // Our host, but no connection behind the CID.
        let cid = our_cid(0, 5);
        let dgram = short_datagram(&cid, &[0xab; 32]);

        assert_eq!(
            worker.route_datagram(peer, dgram, None, false),
            Some(DropReason::ConnectionNotFound)
        );

        let reset = recv(&client).await;
        assert_eq!(
            &reset[reset.len() - 16..],
            &quix::token::reset_token(&SECRET, &cid)
        );
    }

    #[tokio::test]
    async fn no_reset_without_secret() {
        let mut cfg = settings();
        cfg.stateless_reset_secret = None;

        let (mut worker, _handle, _created) = worker_with(cfg).await;
        let (client, peer) = client().await;

        let cid = our_cid(0, 5);
        let dgram = short_datagram(&cid, &[0xab; 32]);

        assert_eq!(
            worker.route_datagram(peer, dgram, None, false),
            Some(DropReason::ConnectionNotFound)
        );

        let mut buf = [0; 64];
        assert!(tokio::time::timeout(
            Duration::from_millis(200),
            client.recv_from(&mut buf)
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn version_negotiation_reply() {
        let (mut worker, _handle, created) = worker_with(settings()).await;
        let (client, peer) = client().await;

        let dgram = long_datagram(
            packet::Type::Initial,
            0xbaba_baba,
            &[0x01; 8],
            &[0x02; 4],
            1200,
        );

        assert_eq!(
            worker.route_datagram(peer, dgram, None, false),
            Some(DropReason::UnsupportedVersion)
        );
        assert!(created.lock().unwrap().is_empty());

        let reply = recv(&client).await;
        let hdr = quix::Header::from_slice(&reply, ROUTABLE_CID_LEN).unwrap();

        assert_eq!(hdr.ty, packet::Type::VersionNegotiation);

        // The reply echoes the client's CIDs, swapped.
        assert_eq!(&*hdr.dcid, &[0x02; 4]);
        assert_eq!(&*hdr.scid, &[0x01; 8]);

        assert_eq!(hdr.versions, Some(vec![quix::PROTOCOL_VERSION]));
    }

    #[tokio::test]
    async fn admission_vetoes() {
        let mut cfg = settings();
        cfg.reject_new_connections = true;

        let (mut worker, _handle, created) = worker_with(cfg).await;
        let (_client, peer) = client().await;

        let dgram = long_datagram(
            packet::Type::Initial,
            quix::PROTOCOL_VERSION,
            &[0x01; 8],
            &[0x02; 4],
            1200,
        );

        assert_eq!(
            worker.route_datagram(peer, dgram.clone(), None, false),
            Some(DropReason::CannotMakeTransport)
        );

        // Same result when the factory itself refuses.
        let (mut worker, _handle, created2) = worker_with(settings()).await;
        worker.factory.refuse = true;

        assert_eq!(
            worker.route_datagram(peer, dgram, None, false),
            Some(DropReason::CannotMakeTransport)
        );

        assert!(created.lock().unwrap().is_empty());
        assert!(created2.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_check() {
        let mut cfg = settings();
        cfg.health_check_token = Some(b"are you ok".to_vec());

        let (mut worker, _handle, _created) = worker_with(cfg).await;
        let (client, peer) = client().await;

        assert_eq!(
            worker.route_datagram(peer, b"are you ok".to_vec(), None, false),
            None
        );

        assert_eq!(recv(&client).await, b"OK");
    }

    #[tokio::test]
    async fn cid_lifecycle() {
        let (mut worker, _handle, created) = worker_with(settings()).await;
        let (_client, peer) = client().await;

        let initial = long_datagram(
            packet::Type::Initial,
            quix::PROTOCOL_VERSION,
            &[0x01; 8],
            &[0x02; 4],
            1200,
        );

        assert_eq!(worker.route_datagram(peer, initial, None, false), None);

        let scid = our_cid(0, 5);

        {
            let mut conns = created.lock().unwrap();
            let conn = &mut conns[0];
            let _ = recv_datagram(conn);

            // Announce a server-chosen CID, then bind it.
            conn.control.connection_id_available(scid.clone());
            conn.control.connection_id_bound();
        }

        worker.drain_commands();

        // Short header traffic to the new CID now routes to the connection.
        let dgram = short_datagram(&scid, &[0xab; 16]);
        assert_eq!(worker.route_datagram(peer, dgram, None, false), None);

        {
            let mut conns = created.lock().unwrap();
            let incoming = recv_datagram(&mut conns[0]);
            assert_eq!(&incoming.buf[1..9], &*scid);
        }

        // The provisional source-identity route is gone.
        let handshake = long_datagram(
            packet::Type::Handshake,
            quix::PROTOCOL_VERSION,
            &[0x01; 8],
            &[0x02; 4],
            64,
        );
        assert_eq!(
            worker.route_datagram(peer, handshake, None, false),
            Some(DropReason::ConnectionNotFound)
        );

        // Unbind retires the CID: in-flight datagrams are absorbed quietly.
        {
            let conns = created.lock().unwrap();
            conns[0].control.unbind(vec![scid.clone()]);
        }

        worker.drain_commands();
        assert_eq!(worker.conns.len(), 0);

        let dgram = short_datagram(&scid, &[0xab; 16]);
        assert_eq!(
            worker.route_datagram(peer, dgram, None, false),
            Some(DropReason::RejectedCid)
        );
    }

    #[tokio::test]
    async fn retire_single_cid() {
        let (mut worker, _handle, created) = worker_with(settings()).await;
        let (_client, peer) = client().await;

        let initial = long_datagram(
            packet::Type::Initial,
            quix::PROTOCOL_VERSION,
            &[0x01; 8],
            &[0x02; 4],
            1200,
        );
        assert_eq!(worker.route_datagram(peer, initial, None, false), None);

        let scid_a = our_cid(0, 5);
        let scid_b = our_cid(0, 5);

        {
            let mut conns = created.lock().unwrap();
            let conn = &mut conns[0];
            let _ = recv_datagram(conn);

            conn.control.connection_id_available(scid_a.clone());
            conn.control.connection_id_available(scid_b.clone());
            conn.control.retire_connection_id(scid_a.clone());
        }

        worker.drain_commands();

        // The retired CID absorbs datagrams, its sibling still routes.
        assert_eq!(
            worker.route_datagram(
                peer,
                short_datagram(&scid_a, &[1; 16]),
                None,
                false
            ),
            Some(DropReason::RejectedCid)
        );

        assert_eq!(
            worker.route_datagram(
                peer,
                short_datagram(&scid_b, &[1; 16]),
                None,
                false
            ),
            None
        );
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let (mut worker, handle, created) = worker_with(settings()).await;
        let (_client, peer) = client().await;

        let initial = long_datagram(
            packet::Type::Initial,
            quix::PROTOCOL_VERSION,
            &[0x01; 8],
            &[0x02; 4],
            1200,
        );
        assert_eq!(
            worker.route_datagram(peer, initial.clone(), None, false),
            None
        );

        let reason = CloseReason {
            error_code: 0x2, // CONNECTION_REFUSED
            reason: b"going away".to_vec(),
        };

        handle.shutdown_all_connections(reason.clone());
        handle.shutdown_all_connections(reason.clone());

        worker.drain_commands();

        {
            let mut conns = created.lock().unwrap();
            let conn = &mut conns[0];
            let _ = recv_datagram(conn);

            // Exactly one shutdown event despite the repeated command.
            match conn.rx.try_recv().unwrap() {
                ConnEvent::Shutdown(r) => assert_eq!(r, reason),
                ev => panic!("unexpected event: {ev:?}"),
            }
            assert!(conn.rx.try_recv().is_err());
        }

        // Everything after the shutdown is dropped on the floor.
        assert_eq!(
            worker.route_datagram(peer, initial, None, false),
            Some(DropReason::ServerShutdown)
        );
    }

    #[tokio::test]
    async fn takeover_forward_and_receive() {
        // The new process (id 1) holds the listening socket and forwards
        // traffic for connections still owned by the old process (id 0).
        let mut new_cfg = settings();
        new_cfg.process_id = 1;

        let (mut new_worker, new_handle, _created) =
            worker_with(new_cfg).await;

        let (mut old_worker, _old_handle, old_created) =
            worker_with(settings()).await;

        let takeover_socket =
            Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let takeover_addr = takeover_socket.local_addr().unwrap();
        old_worker.allow_takeover(Arc::clone(&takeover_socket));

        new_handle.start_packet_forwarding(takeover_addr);
        new_worker.drain_commands();

        let (_client, peer) = client().await;

        // The old process owns this connection.
        let dcid = our_cid(0, 5);
        let initial = long_datagram(
            packet::Type::Initial,
            quix::PROTOCOL_VERSION,
            &dcid,
            &[0x02; 4],
            1200,
        );
        assert_eq!(old_worker.route_datagram(peer, initial, None, false), None);

        // A handshake packet for it lands on the new process instead.
        let handshake = long_datagram(
            packet::Type::Handshake,
            quix::PROTOCOL_VERSION,
            &dcid,
            &[0x02; 4],
            256,
        );

        assert_eq!(
            new_worker.route_datagram(peer, handshake.clone(), None, false),
            None
        );

        let wrapped = recv(&takeover_socket).await;

        let fwd = takeover::decode(&wrapped).unwrap();
        assert_eq!(fwd.peer_addr, peer);
        assert_eq!(fwd.datagram, &handshake[..]);

        // The old worker unwraps and routes to the original connection,
        // with the original peer address.
        old_worker.on_takeover_datagram(&wrapped);

        let mut conns = old_created.lock().unwrap();
        let _initial = recv_datagram(&mut conns[0]);
        let incoming = recv_datagram(&mut conns[0]);

        assert_eq!(incoming.buf, handshake);
        assert_eq!(incoming.peer_addr, peer);
        assert!(incoming.forwarded);
    }

    #[tokio::test]
    async fn initials_never_forwarded() {
        let mut cfg = settings();
        cfg.process_id = 1;

        let (mut worker, handle, created) = worker_with(cfg).await;

        let sibling =
            Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        handle.start_packet_forwarding(sibling.local_addr().unwrap());
        worker.drain_commands();

        let (_client, peer) = client().await;

        // An Initial whose CID happens to decode to the other process still
        // creates a local connection.
        let dcid = our_cid(0, 5);
        let initial = long_datagram(
            packet::Type::Initial,
            quix::PROTOCOL_VERSION,
            &dcid,
            &[0x02; 4],
            1200,
        );

        assert_eq!(worker.route_datagram(peer, initial, None, false), None);
        assert_eq!(created.lock().unwrap().len(), 1);

        let mut buf = [0; 2048];
        assert!(tokio::time::timeout(
            Duration::from_millis(200),
            sibling.recv_from(&mut buf)
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn forwarded_datagrams_not_reforwarded() {
        let mut cfg = settings();
        cfg.process_id = 1;

        let (mut worker, handle, _created) = worker_with(cfg).await;

        let sibling =
            Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        handle.start_packet_forwarding(sibling.local_addr().unwrap());
        worker.drain_commands();

        let (_client, peer) = client().await;

        let dcid = our_cid(0, 5);
        let handshake = long_datagram(
            packet::Type::Handshake,
            quix::PROTOCOL_VERSION,
            &dcid,
            &[0x02; 4],
            256,
        );

        // Already forwarded once: drop instead of bouncing it back.
        assert_eq!(
            worker.route_datagram(peer, handshake, None, true),
            Some(DropReason::ConnectionNotFound)
        );

        let mut buf = [0; 2048];
        assert!(tokio::time::timeout(
            Duration::from_millis(200),
            sibling.recv_from(&mut buf)
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn stop_forwarding_immediately() {
        let mut cfg = settings();
        cfg.process_id = 1;

        let (mut worker, handle, _created) = worker_with(cfg).await;

        let sibling =
            Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        handle.start_packet_forwarding(sibling.local_addr().unwrap());
        handle.stop_packet_forwarding(Duration::ZERO);
        worker.drain_commands();

        let (_client, peer) = client().await;

        let dcid = our_cid(0, 5);
        let handshake = long_datagram(
            packet::Type::Handshake,
            quix::PROTOCOL_VERSION,
            &dcid,
            &[0x02; 4],
            256,
        );

        assert_eq!(
            worker.route_datagram(peer, handshake, None, false),
            Some(DropReason::ConnectionNotFound)
        );
    }

    #[tokio::test]
    async fn spawned_worker_end_to_end() {
        let (worker, _handle, created) = worker_with(settings()).await;
        let server_addr = worker.local_addr();

        tokio::spawn(worker);

        let (client, _peer) = client().await;

        let initial = long_datagram(
            packet::Type::Initial,
            quix::PROTOCOL_VERSION,
            &[0x01; 8],
            &[0x02; 4],
            1200,
        );

        client.send_to(&initial, server_addr).await.unwrap();

        // Wait for the router task to admit the connection.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if created.lock().unwrap().len() == 1 {
                break;
            }

            assert!(Instant::now() < deadline, "connection never created");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut conns = created.lock().unwrap();
        let incoming = recv_datagram(&mut conns[0]);
        assert_eq!(incoming.buf, initial);
    }
}
