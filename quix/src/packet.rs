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

use crate::cid::ConnectionId;
use crate::cid::MAX_CID_LEN;
use crate::rand;
use crate::token::RESET_TOKEN_LEN;

const FORM_BIT: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const KEY_PHASE_BIT: u8 = 0x04;

const TYPE_MASK: u8 = 0x30;
const TYPE_SHIFT: usize = 4;

const SHORT_RESERVED_MASK: u8 = 0x18;

const PKT_NUM_MASK: u8 = 0x03;

/// The maximum length of a truncated packet number.
pub const MAX_PKT_NUM_LEN: usize = 4;

/// The length of the integrity tag trailing a Retry packet.
pub const RETRY_INTEGRITY_TAG_LEN: usize = 16;

/// The minimum length of the destination CID in a client Initial packet.
pub const MIN_INITIAL_DCID_LEN: usize = 8;

/// QUIC packet type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    /// Initial packet.
    Initial,

    /// Retry packet.
    Retry,

    /// Handshake packet.
    Handshake,

    /// 0-RTT packet.
    ZeroRTT,

    /// Version negotiation packet.
    VersionNegotiation,

    /// 1-RTT short header packet.
    Short,
}

/// Returns true if the byte carries a long header form bit.
pub fn header_form_is_long(b: u8) -> bool {
    b & FORM_BIT != 0
}

/// Extracts the destination CID of a short-header packet without allocating
/// or touching any of the protected header bits.
pub fn short_dcid(buf: &[u8], dcid_len: usize) -> Option<&[u8]> {
    if header_form_is_long(*buf.first()?) {
        return None;
    }

    buf.get(1..1 + dcid_len)
}

/// A QUIC packet's header.
#[derive(Clone, PartialEq, Eq)]
pub struct Header<'a> {
    /// The type of the packet.
    pub ty: Type,

    /// The version of the packet. Zero for short headers.
    pub version: u32,

    /// The destination connection ID of the packet.
    pub dcid: ConnectionId<'a>,

    /// The source connection ID of the packet. Empty for short headers.
    pub scid: ConnectionId<'a>,

    /// The address verification token of the packet. Only present in
    /// `Initial` and `Retry` packets; for `Retry` the trailing integrity tag
    /// is not part of the token.
    pub token: Option<Vec<u8>>,

    /// The list of versions in the packet. Only present in
    /// `VersionNegotiation` packets.
    pub versions: Option<Vec<u32>>,

    /// The key phase bit of the packet. Only meaningful for short headers,
    /// after header protection has been removed.
    pub key_phase: bool,
}

impl<'a> Header<'a> {
    /// Parses a QUIC packet header from the given buffer.
    ///
    /// The `dcid_len` parameter is the length of the destination connection
    /// IDs this endpoint issues, required to parse short header packets.
    ///
    /// Only the header invariants are parsed: the length field, packet
    /// number, and payload are left in the buffer. Use [`parse_header()`]
    /// to also locate the packet number.
    pub fn from_slice(buf: &'a [u8], dcid_len: usize) -> Result<Header<'a>> {
        let mut b = octets::Octets::with_slice(buf);
        Header::from_bytes(&mut b, dcid_len)
    }

    pub fn from_bytes(
        b: &mut octets::Octets<'a>, dcid_len: usize,
    ) -> Result<Header<'a>> {
        let first = b.get_u8()?;

        if !header_form_is_long(first) {
            if first & FIXED_BIT == 0 {
                return Err(Error::InvalidHeader);
            }

            if first & SHORT_RESERVED_MASK != 0 {
                return Err(Error::InvalidPacket);
            }

            if dcid_len > MAX_CID_LEN {
                return Err(Error::InvalidPacket);
            }

            let dcid = b.get_bytes(dcid_len)?;

            return Ok(Header {
                ty: Type::Short,
                version: 0,
                dcid: ConnectionId::from_ref(dcid.buf()),
                scid: ConnectionId::default(),
                token: None,
                versions: None,
                key_phase: first & KEY_PHASE_BIT != 0,
            });
        }

        let version = b.get_u32()?;

        let dcid_len = b.get_u8()?;
        if usize::from(dcid_len) > MAX_CID_LEN {
            return Err(Error::InvalidPacket);
        }
        let dcid = b.get_bytes(usize::from(dcid_len))?;

        let scid_len = b.get_u8()?;
        if usize::from(scid_len) > MAX_CID_LEN {
            return Err(Error::InvalidPacket);
        }
        let scid = b.get_bytes(usize::from(scid_len))?;

        if version == 0 {
            // The remainder of a version negotiation packet is the list of
            // supported versions, so it must be a positive multiple of four.
            if b.cap() == 0 || b.cap() % 4 != 0 {
                trace!("version negotiation packet has invalid length");
                return Err(Error::InvalidPacket);
            }

            let mut versions = Vec::with_capacity(b.cap() / 4);

            while b.cap() > 0 {
                versions.push(b.get_u32()?);
            }

            return Ok(Header {
                ty: Type::VersionNegotiation,
                version,
                dcid: ConnectionId::from_ref(dcid.buf()),
                scid: ConnectionId::from_ref(scid.buf()),
                token: None,
                versions: Some(versions),
                key_phase: false,
            });
        }

        let ty = match (first & TYPE_MASK) >> TYPE_SHIFT {
            0x00 => Type::Initial,
            0x01 => Type::ZeroRTT,
            0x02 => Type::Handshake,
            0x03 => Type::Retry,
            _ => unreachable!(),
        };

        let token = match ty {
            Type::Initial => Some(b.get_bytes_with_varint_length()?.to_vec()),

            Type::Retry => {
                // The token must be at least one byte, followed by the
                // integrity tag.
                if b.cap() <= RETRY_INTEGRITY_TAG_LEN {
                    return Err(Error::InvalidHeader);
                }

                Some(b.get_bytes(b.cap() - RETRY_INTEGRITY_TAG_LEN)?.to_vec())
            },

            _ => None,
        };

        Ok(Header {
            ty,
            version,
            dcid: ConnectionId::from_ref(dcid.buf()),
            scid: ConnectionId::from_ref(scid.buf()),
            token,
            versions: None,
            key_phase: false,
        })
    }

    /// Writes the header to the given buffer.
    ///
    /// For long headers the length field and the packet number are *not*
    /// written; the packet builder reserves and back-fills them once the
    /// body is known. `pkt_num_len` is only used to set the low bits of the
    /// first byte and must be in `1..=4` for packet types that carry a
    /// packet number.
    pub fn to_bytes(
        &self, pkt_num_len: usize, out: &mut octets::OctetsMut,
    ) -> Result<()> {
        if self.ty == Type::VersionNegotiation {
            return Err(Error::InvalidState);
        }

        let carries_pkt_num = self.ty != Type::Retry;

        if carries_pkt_num && !(1..=MAX_PKT_NUM_LEN).contains(&pkt_num_len) {
            return Err(Error::InvalidState);
        }

        if self.ty == Type::Short {
            let mut first = FIXED_BIT | (pkt_num_len as u8 - 1) & PKT_NUM_MASK;

            if self.key_phase {
                first |= KEY_PHASE_BIT;
            }

            out.put_u8(first)?;
            out.put_bytes(&self.dcid)?;

            return Ok(());
        }

        let ty: u8 = match self.ty {
            Type::Initial => 0x00,
            Type::ZeroRTT => 0x01,
            Type::Handshake => 0x02,
            Type::Retry => 0x03,
            _ => unreachable!(),
        };

        let mut first = FORM_BIT | FIXED_BIT | (ty << TYPE_SHIFT);

        if carries_pkt_num {
            first |= (pkt_num_len as u8 - 1) & PKT_NUM_MASK;
        }

        out.put_u8(first)?;

        out.put_u32(self.version)?;

        out.put_u8(self.dcid.len() as u8)?;
        out.put_bytes(&self.dcid)?;

        out.put_u8(self.scid.len() as u8)?;
        out.put_bytes(&self.scid)?;

        match self.ty {
            Type::Initial => match self.token {
                Some(ref v) => {
                    out.put_varint(v.len() as u64)?;
                    out.put_bytes(v)?;
                },

                None => {
                    out.put_varint(0)?;
                },
            },

            // The Retry token has no length prefix; the caller appends the
            // integrity tag.
            Type::Retry => {
                let token = self.token.as_ref().ok_or(Error::InvalidState)?;
                out.put_bytes(token)?;
            },

            _ => (),
        }

        Ok(())
    }
}

impl std::fmt::Debug for Header<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.ty)?;

        if self.ty != Type::Short {
            write!(f, " version={:x}", self.version)?;
        }

        write!(f, " dcid={:?}", self.dcid)?;

        if self.ty != Type::Short {
            write!(f, " scid={:?}", self.scid)?;
        }

        if let Some(ref token) = self.token {
            write!(f, " token_len={}", token.len())?;
        }

        if let Some(ref versions) = self.versions {
            write!(f, " versions={versions:x?}")?;
        }

        if self.ty == Type::Short {
            write!(f, " key_phase={}", self.key_phase)?;
        }

        Ok(())
    }
}

/// A fully located packet header.
///
/// In addition to the parsed [`Header`] this carries everything the caller
/// needs to find and decode the (still protected) packet number.
#[derive(Debug, PartialEq)]
pub struct ParsedHeader<'a> {
    /// The parsed header.
    pub hdr: Header<'a>,

    /// The length of the truncated packet number, from the first byte's low
    /// bits. Zero for Retry and version negotiation packets.
    pub pkt_num_len: usize,

    /// The value of the header's length field: packet number plus protected
    /// payload. For short headers this is the rest of the buffer.
    pub payload_len: usize,

    /// Offset of the packet number field from the start of the buffer.
    pub pkt_num_off: usize,
}

/// Parses a packet header and locates its packet number field.
///
/// When `is_server` is set, client Initial packets whose destination CID is
/// shorter than [`MIN_INITIAL_DCID_LEN`] are rejected.
pub fn parse_header<'a>(
    buf: &'a [u8], dcid_len: usize, is_server: bool,
) -> Result<ParsedHeader<'a>> {
    let mut b = octets::Octets::with_slice(buf);

    let first = b.peek_u8()?;
    let hdr = Header::from_bytes(&mut b, dcid_len)?;

    let payload_len = match hdr.ty {
        Type::VersionNegotiation | Type::Retry =>
            return Ok(ParsedHeader {
                hdr,
                pkt_num_len: 0,
                payload_len: 0,
                pkt_num_off: b.off(),
            }),

        Type::Initial => {
            if is_server && hdr.dcid.len() < MIN_INITIAL_DCID_LEN {
                return Err(Error::InvalidHeader);
            }

            b.get_varint()? as usize
        },

        Type::ZeroRTT | Type::Handshake => b.get_varint()? as usize,

        Type::Short => b.cap(),
    };

    if payload_len > b.cap() {
        return Err(Error::BufferTooShort);
    }

    let pkt_num_len = usize::from(first & PKT_NUM_MASK) + 1;

    if payload_len < pkt_num_len {
        return Err(Error::BufferTooShort);
    }

    Ok(ParsedHeader {
        hdr,
        pkt_num_len,
        payload_len,
        pkt_num_off: b.off(),
    })
}

/// Returns the shortest encoded length for a packet number, given the
/// largest packet number acknowledged by the peer.
pub fn pkt_num_len(pn: u64, largest_acked: u64) -> usize {
    let num_unacked = pn.saturating_sub(largest_acked);

    if num_unacked < 1 << 7 {
        1
    } else if num_unacked < 1 << 15 {
        2
    } else if num_unacked < 1 << 23 {
        3
    } else {
        4
    }
}

/// Writes a truncated packet number using the given encoded length.
pub fn encode_pkt_num(
    pn: u64, len: usize, b: &mut octets::OctetsMut,
) -> Result<()> {
    match len {
        1 => b.put_u8(pn as u8)?,

        2 => b.put_u16(pn as u16)?,

        3 => b.put_u24(pn as u32)?,

        4 => b.put_u32(pn as u32)?,

        _ => return Err(Error::InvalidState),
    };

    Ok(())
}

/// Reconstructs a full packet number from its truncated form.
///
/// Returns the 62-bit value closest to `expected` whose low `8 * len` bits
/// equal `truncated`. When `expected` is small the result stays in the low
/// window rather than wrapping.
pub fn decode_pkt_num(truncated: u64, len: usize, expected: u64) -> u64 {
    let pn_nbits = 8 * len as u64;
    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | truncated;

    if candidate + pn_hwin <= expected && candidate < (1u64 << 62) - pn_win {
        return candidate + pn_win;
    }

    if candidate > expected + pn_hwin && candidate >= pn_win {
        return candidate - pn_win;
    }

    candidate
}

/// Writes a version negotiation packet into `out`, in response to a packet
/// carrying `scid` and `dcid`. The reply echoes the CIDs swapped and lists
/// `versions` in order.
pub fn negotiate_version(
    scid: &ConnectionId, dcid: &ConnectionId, versions: &[u32], out: &mut [u8],
) -> Result<usize> {
    let mut b = octets::OctetsMut::with_slice(out);

    let first = rand::rand_u8() | FORM_BIT;

    b.put_u8(first)?;
    b.put_u32(0)?;

    b.put_u8(scid.len() as u8)?;
    b.put_bytes(scid)?;

    b.put_u8(dcid.len() as u8)?;
    b.put_bytes(dcid)?;

    for &version in versions {
        b.put_u32(version)?;
    }

    Ok(b.off())
}

/// Writes a stateless reset datagram into `out`.
///
/// The datagram masquerades as a short-header packet: a fixed-bit first
/// byte, unpredictable filler, and the reset token as the final 16 bytes so
/// the recipient can locate it without parsing.
pub fn stateless_reset(
    token: &[u8; RESET_TOKEN_LEN], max_len: usize, out: &mut [u8],
) -> Result<usize> {
    let len = std::cmp::min(max_len, out.len());

    // First byte, at least 5 bytes of filler, and the token.
    if len < 1 + 5 + RESET_TOKEN_LEN {
        return Err(Error::BufferTooShort);
    }

    rand::rand_bytes(&mut out[..len - RESET_TOKEN_LEN]);

    out[0] = FIXED_BIT | (out[0] & !FORM_BIT & !FIXED_BIT);

    out[len - RESET_TOKEN_LEN..len].copy_from_slice(token);

    Ok(len)
}
