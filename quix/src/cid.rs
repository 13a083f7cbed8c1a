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

use crate::Error;
use crate::Result;

use crate::rand;

/// The maximum length of a connection ID.
pub const MAX_CID_LEN: usize = 20;

/// The length of server-chosen connection IDs carrying routing information.
pub const ROUTABLE_CID_LEN: usize = 8;

/// Version tag carried in the two most significant bits of a routable CID's
/// first byte.
const CID_VERSION: u8 = 0x1;

const CID_VERSION_MASK: u8 = 0xc0;
const CID_VERSION_SHIFT: u8 = 6;
const CID_PROCESS_ID_MASK: u8 = 0x01;

/// A QUIC connection ID.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId<'a>(std::borrow::Cow<'a, [u8]>);

impl<'a> Default for ConnectionId<'a> {
    fn default() -> Self {
        Self::from_vec(Vec::new())
    }
}

impl<'a> ConnectionId<'a> {
    /// Creates a new connection ID from the given slice, without copying.
    pub const fn from_ref(cid: &'a [u8]) -> Self {
        Self(std::borrow::Cow::Borrowed(cid))
    }

    /// Creates an owned connection ID from the given vector.
    pub const fn from_vec(cid: Vec<u8>) -> Self {
        Self(std::borrow::Cow::Owned(cid))
    }

    /// Converts the connection ID into an owned one, copying if needed.
    pub fn into_owned(self) -> ConnectionId<'static> {
        ConnectionId(std::borrow::Cow::Owned(self.0.into_owned()))
    }
}

impl<'a> From<Vec<u8>> for ConnectionId<'a> {
    fn from(v: Vec<u8>) -> Self {
        Self::from_vec(v)
    }
}

impl<'a> std::ops::Deref for ConnectionId<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<'a> AsRef<[u8]> for ConnectionId<'a> {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<'a> std::fmt::Debug for ConnectionId<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for c in self.as_ref() {
            write!(f, "{c:02x}")?;
        }

        Ok(())
    }
}

/// Routing identity encoded in a server-chosen connection ID.
///
/// Server-chosen CIDs are self-describing: the worker recovers the owning
/// host, process and worker from the CID alone, without any shared state.
///
/// Layout of a routable CID:
///
/// ```text
/// byte 0: version (2 bits) | random (5 bits) | process id (1 bit)
/// bytes 1..3: host id (big-endian u16)
/// byte 3: worker id
/// bytes 4..8: random nonce
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutingInfo {
    /// Identity of the server process, `0` or `1`.
    pub process_id: u8,

    /// Index of the worker that owns the connection.
    pub worker_id: u8,

    /// Identity of the host within its deployment.
    pub host_id: u16,
}

impl RoutingInfo {
    /// Generates a fresh routable connection ID carrying this identity.
    pub fn generate_cid(&self) -> ConnectionId<'static> {
        let mut cid = [0u8; ROUTABLE_CID_LEN];

        rand::rand_bytes(&mut cid);

        cid[0] &= !(CID_VERSION_MASK | CID_PROCESS_ID_MASK);
        cid[0] |= CID_VERSION << CID_VERSION_SHIFT;
        cid[0] |= self.process_id & CID_PROCESS_ID_MASK;

        cid[1..3].copy_from_slice(&self.host_id.to_be_bytes());
        cid[3] = self.worker_id;

        ConnectionId::from_vec(cid.to_vec())
    }

    /// Recovers the routing identity from a connection ID.
    ///
    /// Fails with [`Error::InvalidPacket`] if the CID is shorter than
    /// [`ROUTABLE_CID_LEN`] or was not produced by [`generate_cid()`].
    ///
    /// [`generate_cid()`]: RoutingInfo::generate_cid
    pub fn from_cid(cid: &ConnectionId) -> Result<RoutingInfo> {
        if cid.len() < ROUTABLE_CID_LEN {
            return Err(Error::InvalidPacket);
        }

        if (cid[0] & CID_VERSION_MASK) >> CID_VERSION_SHIFT != CID_VERSION {
            return Err(Error::InvalidPacket);
        }

        Ok(RoutingInfo {
            process_id: cid[0] & CID_PROCESS_ID_MASK,
            worker_id: cid[3],
            host_id: u16::from_be_bytes([cid[1], cid[2]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_info_roundtrip() {
        let info = RoutingInfo {
            process_id: 1,
            worker_id: 42,
            host_id: 0xbeef,
        };

        let cid = info.generate_cid();
        assert_eq!(cid.len(), ROUTABLE_CID_LEN);

        assert_eq!(RoutingInfo::from_cid(&cid), Ok(info));
    }

    #[test]
    fn routing_info_distinct_nonces() {
        let info = RoutingInfo {
            process_id: 0,
            worker_id: 7,
            host_id: 1,
        };

        // Identity matches while the CIDs themselves differ.
        let cid1 = info.generate_cid();
        let cid2 = info.generate_cid();

        assert_ne!(cid1, cid2);
        assert_eq!(RoutingInfo::from_cid(&cid1), RoutingInfo::from_cid(&cid2));
    }

    #[test]
    fn short_cid() {
        let cid = ConnectionId::from_ref(&[0x55; 7]);
        assert_eq!(RoutingInfo::from_cid(&cid), Err(Error::InvalidPacket));
    }

    #[test]
    fn wrong_version() {
        let mut raw = [0u8; ROUTABLE_CID_LEN];
        raw[0] = 0x00; // version bits cleared

        let cid = ConnectionId::from_ref(&raw);
        assert_eq!(RoutingInfo::from_cid(&cid), Err(Error::InvalidPacket));
    }

    #[test]
    fn client_chosen_cid_rejected() {
        // A 20 byte random-looking CID with the wrong version tag.
        let mut raw = [0xabu8; MAX_CID_LEN];
        raw[0] = 0x80;

        let cid = ConnectionId::from_ref(&raw);
        assert!(RoutingInfo::from_cid(&cid).is_err());
    }
}
