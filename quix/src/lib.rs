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

//! quix is the QUIC wire codec used by tokio-quix.
//!
//! It implements bit-exact, adversary-tolerant parsing and serialization of
//! QUIC packet headers and transport frames, plus the pieces of server-side
//! packet handling that don't need connection state: packet builders with
//! length/packet-number back-filling, routable server connection IDs, and
//! stateless reset tokens.
//!
//! The crate is sans-IO and synchronous: nothing here touches sockets,
//! timers or cryptographic keys. AEAD geometry enters only as sizes (see
//! [`builder::CryptoOverhead`]), and record protection, handshake and
//! recovery live in the caller.
//!
//! ## Parsing
//!
//! [`Header::from_slice()`] parses the header invariants of a packet.
//! [`packet::parse_header()`] additionally locates the (still protected)
//! packet number. Frames are decoded from a decrypted payload with
//! [`frame::Frame::from_bytes()`]:
//!
//! ```
//! let buf = [0x01, 0x00, 0x00];
//!
//! let mut b = octets::Octets::with_slice(&buf);
//! let frame = quix::frame::Frame::from_bytes(
//!     &mut b,
//!     quix::packet::Type::Short,
//!     &quix::frame::CodecParams::default(),
//! )?;
//!
//! assert_eq!(frame, quix::frame::Frame::Ping);
//! # Ok::<(), quix::Error>(())
//! ```
//!
//! ## Building packets
//!
//! [`builder::OwnedPacketBuilder`] appends into owned buffers, while
//! [`builder::SlicePacketBuilder`] writes into a caller-supplied buffer and
//! back-fills in place. Both enforce the minimum encrypted body size that
//! header protection sampling requires.

#![allow(clippy::upper_case_acronyms)]

#[macro_use]
extern crate log;

/// The current QUIC wire version.
pub const PROTOCOL_VERSION: u32 = PROTOCOL_VERSION_V1;

const PROTOCOL_VERSION_V1: u32 = 0x0000_0001;

/// The maximum length of a connection ID.
pub const MAX_CONN_ID_LEN: usize = cid::MAX_CID_LEN;

/// The minimum UDP payload of a client Initial packet.
///
/// Smaller datagrams claiming to carry an Initial packet are dropped
/// without creating a connection.
pub const MIN_CLIENT_INITIAL_LEN: usize = 1200;

/// Returns true when `version` can be handled by this codec.
pub fn version_is_supported(version: u32) -> bool {
    matches!(version, PROTOCOL_VERSION_V1)
}

pub mod builder;
pub mod cid;
pub mod frame;
pub mod packet;
pub mod ranges;
pub mod token;

mod error;
mod rand;

pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::error::WireErrorCode;

pub use crate::cid::ConnectionId;
pub use crate::cid::RoutingInfo;

pub use crate::packet::Header;
pub use crate::packet::Type;
