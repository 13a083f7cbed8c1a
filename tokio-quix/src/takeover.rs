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

//! The takeover forwarding protocol.
//!
//! During a zero-downtime restart, two sibling server processes briefly
//! share traffic. A datagram that lands on the wrong process is wrapped and
//! relayed to the sibling, preserving the original peer address and receive
//! time:
//!
//! ```text
//! version:u32 = 1 || addr_len:u16 || addr bytes || rx_time_ns:u64 || datagram
//! ```
//!
//! All integers are big-endian. The address bytes are a one byte family tag
//! (4 or 6), the IP octets, and a two byte port.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::SystemTime;

use quix::Error;
use quix::Result;

/// Version of the forwarding envelope. Siblings must agree on it.
pub const PROTOCOL_VERSION: u32 = 1;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

fn addr_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(..) => 1 + 4 + 2,
        SocketAddr::V6(..) => 1 + 16 + 2,
    }
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Wraps a datagram for relaying to the sibling process.
pub fn encode(
    peer_addr: SocketAddr, rx_time: SystemTime, datagram: &[u8],
) -> Vec<u8> {
    let addr_len = addr_len(&peer_addr);

    let mut out = vec![0; 4 + 2 + addr_len + 8 + datagram.len()];

    let mut b = octets::OctetsMut::with_slice(&mut out);

    // The buffer is sized exactly above, so none of these can fail.
    b.put_u32(PROTOCOL_VERSION).unwrap();
    b.put_u16(addr_len as u16).unwrap();

    match peer_addr.ip() {
        IpAddr::V4(ip) => {
            b.put_u8(FAMILY_V4).unwrap();
            b.put_bytes(&ip.octets()).unwrap();
        },

        IpAddr::V6(ip) => {
            b.put_u8(FAMILY_V6).unwrap();
            b.put_bytes(&ip.octets()).unwrap();
        },
    }

    b.put_u16(peer_addr.port()).unwrap();
    b.put_u64(unix_nanos(rx_time)).unwrap();
    b.put_bytes(datagram).unwrap();

    out
}

/// A decoded forwarding envelope.
#[derive(Debug, PartialEq, Eq)]
pub struct Forwarded<'a> {
    /// The address of the original sender.
    pub peer_addr: SocketAddr,

    /// When the relaying process read the datagram off its socket.
    pub rx_time: SystemTime,

    /// The original datagram bytes.
    pub datagram: &'a [u8],
}

/// Unwraps a datagram relayed by the sibling process.
pub fn decode(buf: &[u8]) -> Result<Forwarded> {
    let mut b = octets::Octets::with_slice(buf);

    if b.get_u32()? != PROTOCOL_VERSION {
        return Err(Error::InvalidPacket);
    }

    let addr_len = usize::from(b.get_u16()?);
    let mut addr = octets::Octets::with_slice(b.get_bytes(addr_len)?.buf());

    let ip: IpAddr = match addr.get_u8()? {
        FAMILY_V4 => {
            let octets: [u8; 4] = addr
                .get_bytes(4)?
                .buf()
                .try_into()
                .map_err(|_| Error::InvalidPacket)?;
            octets.into()
        },

        FAMILY_V6 => {
            let octets: [u8; 16] = addr
                .get_bytes(16)?
                .buf()
                .try_into()
                .map_err(|_| Error::InvalidPacket)?;
            octets.into()
        },

        _ => return Err(Error::InvalidPacket),
    };

    let port = addr.get_u16()?;

    if addr.cap() != 0 {
        return Err(Error::InvalidPacket);
    }

    let rx_time = SystemTime::UNIX_EPOCH + Duration::from_nanos(b.get_u64()?);

    Ok(Forwarded {
        peer_addr: SocketAddr::new(ip, port),
        rx_time,
        datagram: b.get_bytes(b.cap())?.buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_v4() {
        let peer: SocketAddr = "192.0.2.7:4433".parse().unwrap();
        let rx_time = SystemTime::UNIX_EPOCH + Duration::from_nanos(1234567);
        let datagram = [0x40, 1, 2, 3, 4];

        let wrapped = encode(peer, rx_time, &datagram);

        // version || addr_len || family+ip+port || time || payload
        assert_eq!(&wrapped[..4], &[0, 0, 0, 1]);
        assert_eq!(&wrapped[4..6], &[0, 7]);

        let fwd = decode(&wrapped).unwrap();
        assert_eq!(fwd.peer_addr, peer);
        assert_eq!(fwd.rx_time, rx_time);
        assert_eq!(fwd.datagram, datagram);
    }

    #[test]
    fn roundtrip_v6() {
        let peer: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let rx_time = SystemTime::now();
        let datagram = [0xc0; 1200];

        let fwd_buf = encode(peer, rx_time, &datagram);
        let fwd = decode(&fwd_buf).unwrap();

        assert_eq!(fwd.peer_addr, peer);
        assert_eq!(fwd.datagram, &datagram[..]);
    }

    #[test]
    fn rejects_unknown_version() {
        let peer: SocketAddr = "192.0.2.7:4433".parse().unwrap();

        let mut wrapped = encode(peer, SystemTime::now(), &[1, 2, 3]);
        wrapped[3] = 2;

        assert_eq!(decode(&wrapped), Err(Error::InvalidPacket));
    }

    #[test]
    fn rejects_truncated() {
        let peer: SocketAddr = "192.0.2.7:4433".parse().unwrap();

        let wrapped = encode(peer, SystemTime::now(), &[1, 2, 3]);

        // Cut inside the address bytes.
        assert!(decode(&wrapped[..8]).is_err());
    }
}
