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

//! Connection-side plumbing: the datagram envelope delivered to transports,
//! the transport factory contract, lifecycle signalling back to the worker,
//! and the routing tables themselves.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use quix::ConnectionId;
use tokio::sync::mpsc;

const U64_SZ: usize = std::mem::size_of::<u64>();
const MAX_CONN_ID_QUADS: usize = quix::MAX_CONN_ID_LEN.div_ceil(U64_SZ);

/// A datagram addressed to one connection.
#[derive(Debug)]
pub struct Incoming {
    /// The peer the datagram came from. For forwarded datagrams this is the
    /// original sender, not the sibling process.
    pub peer_addr: SocketAddr,

    /// The raw datagram bytes.
    pub buf: Vec<u8>,

    /// When the datagram was read off the socket.
    pub rx_time: Option<SystemTime>,

    /// Whether the datagram was relayed by the takeover sibling.
    pub forwarded: bool,
}

/// Why the worker is tearing a connection down.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// The transport error code for the CONNECTION_CLOSE frame.
    pub error_code: u64,

    /// The reason phrase for the CONNECTION_CLOSE frame.
    pub reason: Vec<u8>,
}

/// Events the worker delivers to a connection's transport.
#[derive(Debug)]
pub enum ConnEvent {
    /// A datagram routed to this connection.
    Datagram(Incoming),

    /// The worker is shutting down; close with the given reason. No further
    /// events follow.
    Shutdown(CloseReason),
}

/// Messages flowing back into the worker's event loop, from connection
/// transports and from [`WorkerHandle`](crate::worker::WorkerHandle).
///
/// All routing table mutation happens on the worker's own task, so these are
/// the only way anything else influences routing.
#[derive(Debug)]
pub(crate) enum Command {
    MapCid {
        conn: u64,
        cid: ConnectionId<'static>,
    },

    CidBound {
        conn: u64,
    },

    RetireCid {
        conn: u64,
        cid: ConnectionId<'static>,
    },

    Unbind {
        conn: u64,
        retired: Vec<ConnectionId<'static>>,
    },

    Shutdown {
        reason: CloseReason,
    },

    StartForwarding {
        sibling: SocketAddr,
    },

    StopForwarding {
        drain: Duration,
    },
}

/// A connection's channel back to its worker.
///
/// This is a plain message sender, not a reference into the worker: a
/// transport can hold it past worker shutdown without keeping any routing
/// state alive, and signals sent after teardown are simply dropped.
#[derive(Clone, Debug)]
pub struct ConnectionControl {
    pub(crate) conn: u64,
    pub(crate) cmds: mpsc::UnboundedSender<Command>,
}

impl ConnectionControl {
    /// Announces a freshly issued server-chosen CID, so datagrams addressed
    /// to it route to this connection.
    pub fn connection_id_available(&self, cid: ConnectionId<'static>) {
        let _ = self.cmds.send(Command::MapCid {
            conn: self.conn,
            cid,
        });
    }

    /// Signals that the peer has started using a server-chosen CID; the
    /// provisional `(peer address, client CID)` route is dropped.
    pub fn connection_id_bound(&self) {
        let _ = self.cmds.send(Command::CidBound { conn: self.conn });
    }

    /// Retires one CID in response to a RETIRE_CONNECTION_ID frame. The CID
    /// absorbs in-flight datagrams for a grace window, then is forgotten.
    pub fn retire_connection_id(&self, cid: ConnectionId<'static>) {
        let _ = self.cmds.send(Command::RetireCid {
            conn: self.conn,
            cid,
        });
    }

    /// Unbinds the connection entirely, retiring every CID still routed to
    /// it. Called when the transport is done.
    pub fn unbind(&self, retired: Vec<ConnectionId<'static>>) {
        let _ = self.cmds.send(Command::Unbind {
            conn: self.conn,
            retired,
        });
    }
}

/// Builds per-connection transports when the worker admits a connection.
///
/// Implementations are called on the worker's own task and must not block:
/// spawn whatever needs to run and return the channel the worker should
/// deliver the connection's events to. Returning an error refuses the
/// connection and the triggering datagram is dropped.
pub trait TransportFactory: Send + 'static {
    fn make_transport(
        &mut self, peer_addr: SocketAddr, hdr: &quix::Header<'_>,
        control: ConnectionControl,
    ) -> io::Result<mpsc::Sender<ConnEvent>>;
}

/// A non-unique connection ID key; multiple keys can map to the same
/// connection.
///
/// QUIC v1 CIDs fit in [`MAX_CONN_ID_QUADS`] machine words, which makes map
/// lookups a few integer comparisons instead of a memcmp. The length is
/// folded into the last word to keep short CIDs with trailing zeroes
/// distinct.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum CidKey {
    Generic(Box<[u8]>),
    Optimized([u64; MAX_CONN_ID_QUADS]),
}

impl From<&[u8]> for CidKey {
    fn from(value: &[u8]) -> Self {
        if value.len() >= MAX_CONN_ID_QUADS * U64_SZ {
            return CidKey::Generic(value.into());
        }

        let mut cid = [0; MAX_CONN_ID_QUADS];

        for (i, c) in value.chunks(U64_SZ).enumerate() {
            let mut quad = [0u8; U64_SZ];
            quad[..c.len()].copy_from_slice(c);
            cid[i] = u64::from_le_bytes(quad);
        }

        *cid.last_mut().unwrap() |= (value.len() as u64) << 56;

        CidKey::Optimized(cid)
    }
}

impl From<&ConnectionId<'_>> for CidKey {
    fn from(value: &ConnectionId<'_>) -> Self {
        value.as_ref().into()
    }
}

pub(crate) struct ConnectionEntry {
    pub tx: mpsc::Sender<ConnEvent>,

    /// The provisional `(peer address, client CID)` route, dropped once a
    /// server CID is bound.
    src_key: Option<(SocketAddr, CidKey)>,

    /// Every CID currently routing to this connection.
    cids: Vec<CidKey>,
}

/// The worker's routing tables.
///
/// Invariant: every live connection is reachable through `by_src`, `by_cid`,
/// or both, and teardown removes all of a connection's entries in one call.
#[derive(Default)]
pub(crate) struct ConnectionMap {
    by_src: HashMap<(SocketAddr, CidKey), u64>,
    by_cid: BTreeMap<CidKey, u64>,

    conns: HashMap<u64, ConnectionEntry>,

    /// Recently retired CIDs, with the deadline until which datagrams
    /// addressed to them are silently absorbed.
    rejected: HashMap<CidKey, Instant>,
}

impl ConnectionMap {
    pub fn insert_initial(
        &mut self, conn: u64, peer: SocketAddr, dcid: CidKey,
        tx: mpsc::Sender<ConnEvent>,
    ) {
        let src_key = (peer, dcid);

        self.by_src.insert(src_key.clone(), conn);
        self.conns.insert(conn, ConnectionEntry {
            tx,
            src_key: Some(src_key),
            cids: Vec::new(),
        });
    }

    pub fn get_by_src(
        &self, peer: SocketAddr, dcid: &CidKey,
    ) -> Option<&ConnectionEntry> {
        let conn = self.by_src.get(&(peer, dcid.clone()))?;
        self.conns.get(conn)
    }

    pub fn get_by_cid(&self, cid: &CidKey) -> Option<&ConnectionEntry> {
        let conn = self.by_cid.get(cid)?;
        self.conns.get(conn)
    }

    pub fn map_cid(&mut self, conn: u64, cid: CidKey) {
        let Some(entry) = self.conns.get_mut(&conn) else {
            return;
        };

        self.by_cid.insert(cid.clone(), conn);
        entry.cids.push(cid);
    }

    pub fn cid_bound(&mut self, conn: u64) {
        let Some(entry) = self.conns.get_mut(&conn) else {
            return;
        };

        if let Some(src_key) = entry.src_key.take() {
            self.by_src.remove(&src_key);
        }
    }

    pub fn retire_cid(&mut self, conn: u64, cid: &CidKey, until: Instant) {
        if self.by_cid.remove(cid).is_some() {
            self.rejected.insert(cid.clone(), until);
        }

        if let Some(entry) = self.conns.get_mut(&conn) {
            entry.cids.retain(|c| c != cid);
        }
    }

    /// Removes every routing entry of `conn` and parks its CIDs (and any
    /// extra `retired` ones) in the rejected table until `until`.
    pub fn unbind(&mut self, conn: u64, retired: Vec<CidKey>, until: Instant) {
        let Some(entry) = self.conns.remove(&conn) else {
            return;
        };

        if let Some(src_key) = entry.src_key {
            self.by_src.remove(&src_key);
        }

        for cid in entry.cids.into_iter().chain(retired) {
            self.by_cid.remove(&cid);
            self.rejected.insert(cid, until);
        }
    }

    /// Whether `cid` was recently retired. Expired entries are purged as
    /// they are encountered.
    pub fn is_rejected(&mut self, cid: &CidKey, now: Instant) -> bool {
        match self.rejected.get(cid) {
            Some(&until) if now < until => true,

            Some(_) => {
                self.rejected.remove(cid);
                false
            },

            None => false,
        }
    }

    /// Removes every connection, handing back their event senders so the
    /// caller can deliver a final shutdown event.
    pub fn drain(&mut self) -> Vec<mpsc::Sender<ConnEvent>> {
        self.by_src.clear();
        self.by_cid.clear();

        self.conns.drain().map(|(_, entry)| entry.tx).collect()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::Sender<ConnEvent> {
        mpsc::channel(1).0
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    #[test]
    fn cid_key_storage() {
        let max_v1_cid = [0xfa; quix::MAX_CONN_ID_LEN];
        assert!(matches!(
            CidKey::from(&max_v1_cid[..]),
            CidKey::Optimized(_)
        ));

        let oversize_cid = [0x1b; quix::MAX_CONN_ID_LEN + 20];
        assert!(matches!(CidKey::from(&oversize_cid[..]), CidKey::Generic(_)));
    }

    #[test]
    fn cid_key_length_disambiguates() {
        // Same bytes, one trailing zero apart.
        let a = CidKey::from(&[1u8, 2, 3, 0][..]);
        let b = CidKey::from(&[1u8, 2, 3][..]);

        assert_ne!(a, b);
    }

    #[test]
    fn src_route_dropped_on_bind() {
        let mut map = ConnectionMap::default();
        let dcid = CidKey::from(&[1u8; 8][..]);

        map.insert_initial(7, addr(), dcid.clone(), sender());
        assert!(map.get_by_src(addr(), &dcid).is_some());

        let scid = CidKey::from(&[2u8; 8][..]);
        map.map_cid(7, scid.clone());

        map.cid_bound(7);

        assert!(map.get_by_src(addr(), &dcid).is_none());
        assert!(map.get_by_cid(&scid).is_some());
    }

    #[test]
    fn unbind_parks_cids() {
        let mut map = ConnectionMap::default();
        let now = Instant::now();
        let until = now + Duration::from_secs(10);

        let dcid = CidKey::from(&[1u8; 8][..]);
        let scid = CidKey::from(&[2u8; 8][..]);

        map.insert_initial(7, addr(), dcid.clone(), sender());
        map.map_cid(7, scid.clone());

        map.unbind(7, vec![], until);

        assert_eq!(map.len(), 0);
        assert!(map.get_by_cid(&scid).is_none());
        assert!(map.is_rejected(&scid, now));

        // Entries expire after the grace window.
        assert!(!map.is_rejected(&scid, until + Duration::from_millis(1)));
        assert!(!map.is_rejected(&scid, now));
    }

    #[test]
    fn retire_single_cid() {
        let mut map = ConnectionMap::default();
        let now = Instant::now();
        let until = now + Duration::from_secs(10);

        let dcid = CidKey::from(&[1u8; 8][..]);
        let scid_a = CidKey::from(&[2u8; 8][..]);
        let scid_b = CidKey::from(&[3u8; 8][..]);

        map.insert_initial(7, addr(), dcid, sender());
        map.map_cid(7, scid_a.clone());
        map.map_cid(7, scid_b.clone());

        map.retire_cid(7, &scid_a, until);

        assert!(map.get_by_cid(&scid_a).is_none());
        assert!(map.is_rejected(&scid_a, now));

        // The connection is still reachable through its other CID.
        assert!(map.get_by_cid(&scid_b).is_some());
    }
}
