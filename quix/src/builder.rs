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

//! Packet assembly.
//!
//! A builder writes the header up front, accepts frames into the body, and
//! back-fills the header's length field and packet number once the body is
//! final. Two builders share the same operation set: [`OwnedPacketBuilder`]
//! appends into buffers it owns, [`SlicePacketBuilder`] writes in place
//! into a caller-supplied buffer.

use crate::Error;
use crate::Result;

use crate::frame::Frame;
use crate::packet;
use crate::packet::Header;
use crate::packet::Type;

/// The length field is back-filled, so it is always encoded in two bytes.
const PKT_LEN_FIELD_LEN: usize = 2;

/// AEAD geometry the builder needs to honor.
///
/// The values come from whatever cipher will seal the packet; the builder
/// never assumes a particular algorithm.
#[derive(Clone, Copy, Debug)]
pub struct CryptoOverhead {
    /// Bytes the AEAD appends to the sealed body.
    pub tag_len: usize,

    /// Bytes of ciphertext the header protection mask samples, starting
    /// four bytes past the start of the packet number.
    pub sample_len: usize,
}

/// Metadata describing a finished packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketMeta {
    /// The full packet number.
    pub pkt_num: u64,

    /// The encoded length of the packet number.
    pub pkt_num_len: usize,

    /// Bytes of header, up to and including the packet number.
    pub header_len: usize,

    /// Bytes of plaintext body, excluding the AEAD tag.
    pub body_len: usize,
}

/// Operations shared by both packet builders.
pub trait PacketBuilder {
    /// Remaining bytes of budget for body data, net of the AEAD tag.
    fn remaining(&self) -> usize;

    /// Appends a frame to the packet body.
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Appends pre-encoded bytes to the packet body.
    fn write_raw(&mut self, data: &[u8]) -> Result<()>;
}

/// How many padding bytes the body still needs so that, once sealed, it
/// contains a full header protection sample.
fn padding_needed(
    pkt_num_len: usize, body_len: usize, overhead: &CryptoOverhead,
) -> usize {
    let min = 4 + overhead.sample_len;
    min.saturating_sub(pkt_num_len + body_len + overhead.tag_len)
}

fn header_carries_pkt_num(ty: Type) -> bool {
    ty != Type::Retry
}

fn header_carries_length(ty: Type) -> bool {
    !matches!(ty, Type::Retry | Type::Short)
}

/// A packet builder that appends into buffers it owns.
pub struct OwnedPacketBuilder {
    remaining: usize,

    header: Vec<u8>,
    body: Vec<u8>,

    pkt_num: u64,
    pkt_num_len: usize,

    carries_length: bool,

    overhead: CryptoOverhead,
}

impl OwnedPacketBuilder {
    /// Starts a packet with the given byte budget.
    ///
    /// Fails with [`Error::BufferTooShort`] if the budget cannot fit the
    /// header; the caller should flush and open a new packet.
    pub fn new(
        budget: usize, hdr: &Header, pkt_num: u64, largest_acked: u64,
        overhead: CryptoOverhead,
    ) -> Result<OwnedPacketBuilder> {
        if hdr.ty == Type::VersionNegotiation {
            return Err(Error::InvalidState);
        }

        let pkt_num_len = if header_carries_pkt_num(hdr.ty) {
            packet::pkt_num_len(pkt_num, largest_acked)
        } else {
            0
        };

        let mut header = vec![0; header_wire_cap(hdr)];

        let mut invariants_len = {
            let mut b = octets::OctetsMut::with_slice(&mut header);
            hdr.to_bytes(pkt_num_len.max(1), &mut b)?;
            b.off()
        };

        header.truncate(invariants_len);

        // Short headers have no length field, so the packet number follows
        // the header immediately and can be written now. Long headers defer
        // both until the body is final.
        if hdr.ty == Type::Short {
            header.resize(invariants_len + pkt_num_len, 0);

            let mut b =
                octets::OctetsMut::with_slice(&mut header[invariants_len..]);
            packet::encode_pkt_num(pkt_num, pkt_num_len, &mut b)?;

            invariants_len += pkt_num_len;
        }

        let header_total = if header_carries_length(hdr.ty) {
            invariants_len + PKT_LEN_FIELD_LEN + pkt_num_len
        } else {
            invariants_len
        };

        if budget < header_total + overhead.tag_len {
            return Err(Error::BufferTooShort);
        }

        Ok(OwnedPacketBuilder {
            remaining: budget - header_total - overhead.tag_len,
            header,
            body: Vec::new(),
            pkt_num,
            pkt_num_len,
            carries_length: header_carries_length(hdr.ty),
            overhead,
        })
    }

    /// Pads the body to the minimum encrypted size, back-fills the header's
    /// length field and packet number, and returns the header bytes, body
    /// bytes and packet metadata.
    pub fn finish(mut self) -> Result<(Vec<u8>, Vec<u8>, PacketMeta)> {
        if self.pkt_num_len > 0 {
            let needed = padding_needed(
                self.pkt_num_len,
                self.body.len(),
                &self.overhead,
            );

            if needed > 0 {
                if needed > self.remaining {
                    return Err(Error::BufferTooShort);
                }

                self.body.resize(self.body.len() + needed, 0);
                self.remaining -= needed;
            }
        }

        if self.carries_length {
            let len =
                self.pkt_num_len + self.body.len() + self.overhead.tag_len;

            let off = self.header.len();
            self.header
                .resize(off + PKT_LEN_FIELD_LEN + self.pkt_num_len, 0);

            let mut b = octets::OctetsMut::with_slice(&mut self.header[off..]);
            b.put_varint_with_len(len as u64, PKT_LEN_FIELD_LEN)?;
            packet::encode_pkt_num(self.pkt_num, self.pkt_num_len, &mut b)?;
        }

        let meta = PacketMeta {
            pkt_num: self.pkt_num,
            pkt_num_len: self.pkt_num_len,
            header_len: self.header.len(),
            body_len: self.body.len(),
        };

        Ok((self.header, self.body, meta))
    }
}

impl PacketBuilder for OwnedPacketBuilder {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let len = frame.wire_len();

        if len > self.remaining {
            return Err(Error::BufferTooShort);
        }

        let off = self.body.len();
        self.body.resize(off + len, 0);

        let mut b = octets::OctetsMut::with_slice(&mut self.body[off..]);
        frame.to_bytes(&mut b)?;

        self.remaining -= len;

        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.remaining {
            return Err(Error::BufferTooShort);
        }

        self.body.extend_from_slice(data);
        self.remaining -= data.len();

        Ok(())
    }
}

/// A packet builder that writes into a caller-supplied buffer.
///
/// The buffer is borrowed for the lifetime of one packet. Offsets of the
/// length field and packet number are recorded at construction and
/// back-filled by [`finish()`](SlicePacketBuilder::finish).
pub struct SlicePacketBuilder<'a> {
    buf: &'a mut [u8],

    /// Write position in `buf`.
    off: usize,

    /// End of the usable region of `buf` for this packet.
    end: usize,

    remaining: usize,

    pkt_len_off: usize,
    pkt_num_off: usize,
    body_off: usize,

    pkt_num: u64,
    pkt_num_len: usize,

    carries_length: bool,

    overhead: CryptoOverhead,
}

impl<'a> SlicePacketBuilder<'a> {
    pub fn new(
        buf: &'a mut [u8], budget: usize, hdr: &Header, pkt_num: u64,
        largest_acked: u64, overhead: CryptoOverhead,
    ) -> Result<SlicePacketBuilder<'a>> {
        if hdr.ty == Type::VersionNegotiation {
            return Err(Error::InvalidState);
        }

        let end = std::cmp::min(budget, buf.len());

        let pkt_num_len = if header_carries_pkt_num(hdr.ty) {
            packet::pkt_num_len(pkt_num, largest_acked)
        } else {
            0
        };

        let carries_length = header_carries_length(hdr.ty);

        let mut b = octets::OctetsMut::with_slice(&mut buf[..end]);

        hdr.to_bytes(pkt_num_len.max(1), &mut b)?;

        let mut pkt_len_off = 0;
        let mut pkt_num_off = 0;

        if carries_length {
            // Reserve the length field and packet number for back-filling.
            pkt_len_off = b.off();
            pkt_num_off = pkt_len_off + PKT_LEN_FIELD_LEN;

            b.put_bytes(&[0; PKT_LEN_FIELD_LEN])?;
            b.skip(pkt_num_len)?;
        } else if hdr.ty == Type::Short {
            pkt_num_off = b.off();
            packet::encode_pkt_num(pkt_num, pkt_num_len, &mut b)?;
        }

        let body_off = b.off();

        if end < body_off + overhead.tag_len {
            return Err(Error::BufferTooShort);
        }

        Ok(SlicePacketBuilder {
            remaining: end - body_off - overhead.tag_len,
            buf,
            off: body_off,
            end,
            pkt_len_off,
            pkt_num_off,
            body_off,
            pkt_num,
            pkt_num_len,
            carries_length,
            overhead,
        })
    }

    /// Pads and back-fills the packet, releasing the borrowed buffer.
    ///
    /// Returns the length of the header (the offset at which the body
    /// starts), the total number of bytes written, and the packet metadata.
    pub fn finish(mut self) -> Result<(usize, usize, PacketMeta)> {
        if self.pkt_num_len > 0 {
            let needed = padding_needed(
                self.pkt_num_len,
                self.off - self.body_off,
                &self.overhead,
            );

            if needed > 0 {
                if needed > self.remaining {
                    return Err(Error::BufferTooShort);
                }

                self.buf[self.off..self.off + needed].fill(0);
                self.off += needed;
                self.remaining -= needed;
            }
        }

        let body_len = self.off - self.body_off;

        if self.carries_length {
            let len = self.pkt_num_len + body_len + self.overhead.tag_len;

            let mut b = octets::OctetsMut::with_slice(
                &mut self.buf[self.pkt_len_off..self.pkt_num_off],
            );
            b.put_varint_with_len(len as u64, PKT_LEN_FIELD_LEN)?;

            let mut b = octets::OctetsMut::with_slice(
                &mut self.buf[self.pkt_num_off..
                    self.pkt_num_off + self.pkt_num_len],
            );
            packet::encode_pkt_num(self.pkt_num, self.pkt_num_len, &mut b)?;
        }

        let meta = PacketMeta {
            pkt_num: self.pkt_num,
            pkt_num_len: self.pkt_num_len,
            header_len: self.body_off,
            body_len,
        };

        Ok((self.body_off, self.off, meta))
    }
}

impl PacketBuilder for SlicePacketBuilder<'_> {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let len = frame.wire_len();

        if len > self.remaining {
            return Err(Error::BufferTooShort);
        }

        let mut b =
            octets::OctetsMut::with_slice(&mut self.buf[self.off..self.end]);
        frame.to_bytes(&mut b)?;

        self.off += len;
        self.remaining -= len;

        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.remaining {
            return Err(Error::BufferTooShort);
        }

        self.buf[self.off..self.off + data.len()].copy_from_slice(data);

        self.off += data.len();
        self.remaining -= data.len();

        Ok(())
    }
}

/// Upper bound for the header invariants of `hdr`, used to size scratch
/// space before the exact length is known.
fn header_wire_cap(hdr: &Header) -> usize {
    let token_len = hdr.token.as_ref().map_or(0, |t| t.len());

    1 + 4 +
        1 + hdr.dcid.len() +
        1 + hdr.scid.len() +
        octets::varint_len(token_len as u64) + token_len +
        packet::MAX_PKT_NUM_LEN
}
