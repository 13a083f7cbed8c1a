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

use crate::packet;
use crate::ranges;

pub const MAX_STREAM_SIZE: u64 = 1 << 62;

/// The longest reason phrase accepted in a CONNECTION_CLOSE frame.
pub const MAX_REASON_LEN: u64 = 1024;

/// The ack delay exponent used before one is negotiated, and for every
/// long header packet.
pub const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;

/// Out-of-band parameters that affect frame decoding.
#[derive(Clone, Copy, Debug)]
pub struct CodecParams {
    /// The peer's negotiated `ack_delay_exponent`, applied to ACK frames in
    /// short header packets. Must be below 64.
    pub peer_ack_delay_exponent: u8,
}

impl Default for CodecParams {
    fn default() -> CodecParams {
        CodecParams {
            peer_ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
        }
    }
}

/// ECN counters carried by an ACK frame, informational only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0_count: u64,
    pub ect1_count: u64,
    pub ecn_ce_count: u64,
}

/// A QUIC transport frame.
///
/// STREAM, CRYPTO, NEW_TOKEN and DATAGRAM payloads borrow from the packet
/// buffer they were decoded from; decoding never copies payload bytes.
#[derive(Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding {
        len: usize,
    },

    Ping,

    Ack {
        /// The peer's reported ack delay in microseconds, already scaled by
        /// the applicable ack delay exponent. On encode the delay is scaled
        /// back down with [`DEFAULT_ACK_DELAY_EXPONENT`].
        ack_delay: u64,
        ranges: ranges::RangeSet,
        ecn_counts: Option<EcnCounts>,
    },

    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },

    StopSending {
        stream_id: u64,
        error_code: u64,
    },

    Crypto {
        offset: u64,
        data: &'a [u8],
    },

    NewToken {
        token: &'a [u8],
    },

    Stream {
        stream_id: u64,
        offset: u64,
        fin: bool,
        data: &'a [u8],
    },

    MaxData {
        max: u64,
    },

    MaxStreamData {
        stream_id: u64,
        max: u64,
    },

    MaxStreamsBidi {
        max: u64,
    },

    MaxStreamsUni {
        max: u64,
    },

    DataBlocked {
        limit: u64,
    },

    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },

    StreamsBlockedBidi {
        limit: u64,
    },

    StreamsBlockedUni {
        limit: u64,
    },

    NewConnectionId {
        seq_num: u64,
        retire_prior_to: u64,
        conn_id: Vec<u8>,
        reset_token: [u8; 16],
    },

    RetireConnectionId {
        seq_num: u64,
    },

    PathChallenge {
        data: [u8; 8],
    },

    PathResponse {
        data: [u8; 8],
    },

    ConnectionClose {
        error_code: u64,
        frame_type: u64,
        reason: Vec<u8>,
    },

    ApplicationClose {
        error_code: u64,
        reason: Vec<u8>,
    },

    HandshakeDone,

    Datagram {
        data: &'a [u8],
    },

    MinStreamData {
        stream_id: u64,
        maximum_data: u64,
        minimum_stream_offset: u64,
    },

    ExpiredStreamData {
        stream_id: u64,
        minimum_stream_offset: u64,
    },
}

impl<'a> Frame<'a> {
    pub fn from_bytes(
        b: &mut octets::Octets<'a>, pkt: packet::Type, params: &CodecParams,
    ) -> Result<Frame<'a>> {
        let frame_type = b.get_varint()?;

        // A frame that can't be fully decoded reports the offending type.
        let frame = parse_frame(frame_type, b, pkt, params).map_err(|e| {
            match e {
                Error::BufferTooShort => Error::InvalidFrame(frame_type),
                e => e,
            }
        })?;

        let allowed = match (pkt, &frame) {
            // PADDING and PING are allowed on all packet types.
            (_, Frame::Padding { .. }) | (_, Frame::Ping { .. }) => true,

            // ACK, CRYPTO, HANDSHAKE_DONE, NEW_TOKEN, PATH_RESPONSE, and
            // RETIRE_CONNECTION_ID can't be sent on 0-RTT packets.
            (packet::Type::ZeroRTT, Frame::Ack { .. }) => false,
            (packet::Type::ZeroRTT, Frame::Crypto { .. }) => false,
            (packet::Type::ZeroRTT, Frame::HandshakeDone) => false,
            (packet::Type::ZeroRTT, Frame::NewToken { .. }) => false,
            (packet::Type::ZeroRTT, Frame::PathResponse { .. }) => false,
            (packet::Type::ZeroRTT, Frame::RetireConnectionId { .. }) => false,
            (packet::Type::ZeroRTT, Frame::ConnectionClose { .. }) => false,

            // ACK, CRYPTO and CONNECTION_CLOSE can be sent on all other
            // packet types.
            (_, Frame::Ack { .. }) => true,
            (_, Frame::Crypto { .. }) => true,
            (_, Frame::ConnectionClose { .. }) => true,

            // All frames are allowed on 0-RTT and 1-RTT packets.
            (packet::Type::Short, _) => true,
            (packet::Type::ZeroRTT, _) => true,

            // All other cases are forbidden.
            (..) => false,
        };

        if !allowed {
            return Err(Error::InvalidPacket);
        }

        Ok(frame)
    }

    pub fn to_bytes(&self, b: &mut octets::OctetsMut) -> Result<usize> {
        let before = b.cap();

        match self {
            Frame::Padding { len } => {
                let mut left = *len;

                while left > 0 {
                    b.put_varint(0x00)?;

                    left -= 1;
                }
            },

            Frame::Ping => {
                b.put_varint(0x01)?;
            },

            Frame::Ack {
                ack_delay,
                ranges,
                ecn_counts,
            } => {
                if ecn_counts.is_none() {
                    b.put_varint(0x02)?;
                } else {
                    b.put_varint(0x03)?;
                }

                let mut it = ranges.iter().rev();

                let first = it.next().unwrap();
                let ack_block = (first.end - 1) - first.start;

                b.put_varint(first.end - 1)?;
                b.put_varint(ack_delay >> DEFAULT_ACK_DELAY_EXPONENT)?;
                b.put_varint(it.len() as u64)?;
                b.put_varint(ack_block)?;

                let mut smallest_ack = first.start;

                for block in it {
                    let gap = smallest_ack - block.end - 1;
                    let ack_block = (block.end - 1) - block.start;

                    b.put_varint(gap)?;
                    b.put_varint(ack_block)?;

                    smallest_ack = block.start;
                }

                if let Some(ecn) = ecn_counts {
                    b.put_varint(ecn.ect0_count)?;
                    b.put_varint(ecn.ect1_count)?;
                    b.put_varint(ecn.ecn_ce_count)?;
                }
            },

            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                b.put_varint(0x04)?;

                b.put_varint(*stream_id)?;
                b.put_varint(*error_code)?;
                b.put_varint(*final_size)?;
            },

            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                b.put_varint(0x05)?;

                b.put_varint(*stream_id)?;
                b.put_varint(*error_code)?;
            },

            Frame::Crypto { offset, data } => {
                b.put_varint(0x06)?;

                b.put_varint(*offset)?;

                // Always encode length field as 2-byte varint.
                b.put_varint_with_len(data.len() as u64, 2)?;
                b.put_bytes(data)?;
            },

            Frame::NewToken { token } => {
                b.put_varint(0x07)?;

                b.put_varint(token.len() as u64)?;
                b.put_bytes(token)?;
            },

            Frame::Stream {
                stream_id,
                offset,
                fin,
                data,
            } => {
                let mut ty: u8 = 0x08;

                // Always encode offset.
                ty |= 0x04;

                // Always encode length.
                ty |= 0x02;

                if *fin {
                    ty |= 0x01;
                }

                b.put_varint(u64::from(ty))?;

                b.put_varint(*stream_id)?;
                b.put_varint(*offset)?;

                // Always encode length field as 2-byte varint.
                b.put_varint_with_len(data.len() as u64, 2)?;
                b.put_bytes(data)?;
            },

            Frame::MaxData { max } => {
                b.put_varint(0x10)?;

                b.put_varint(*max)?;
            },

            Frame::MaxStreamData { stream_id, max } => {
                b.put_varint(0x11)?;

                b.put_varint(*stream_id)?;
                b.put_varint(*max)?;
            },

            Frame::MaxStreamsBidi { max } => {
                b.put_varint(0x12)?;

                b.put_varint(*max)?;
            },

            Frame::MaxStreamsUni { max } => {
                b.put_varint(0x13)?;

                b.put_varint(*max)?;
            },

            Frame::DataBlocked { limit } => {
                b.put_varint(0x14)?;

                b.put_varint(*limit)?;
            },

            Frame::StreamDataBlocked { stream_id, limit } => {
                b.put_varint(0x15)?;

                b.put_varint(*stream_id)?;
                b.put_varint(*limit)?;
            },

            Frame::StreamsBlockedBidi { limit } => {
                b.put_varint(0x16)?;

                b.put_varint(*limit)?;
            },

            Frame::StreamsBlockedUni { limit } => {
                b.put_varint(0x17)?;

                b.put_varint(*limit)?;
            },

            Frame::NewConnectionId {
                seq_num,
                retire_prior_to,
                conn_id,
                reset_token,
            } => {
                b.put_varint(0x18)?;

                b.put_varint(*seq_num)?;
                b.put_varint(*retire_prior_to)?;
                b.put_u8(conn_id.len() as u8)?;
                b.put_bytes(conn_id.as_ref())?;
                b.put_bytes(reset_token.as_ref())?;
            },

            Frame::RetireConnectionId { seq_num } => {
                b.put_varint(0x19)?;

                b.put_varint(*seq_num)?;
            },

            Frame::PathChallenge { data } => {
                b.put_varint(0x1a)?;

                b.put_bytes(data.as_ref())?;
            },

            Frame::PathResponse { data } => {
                b.put_varint(0x1b)?;

                b.put_bytes(data.as_ref())?;
            },

            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                b.put_varint(0x1c)?;

                b.put_varint(*error_code)?;
                b.put_varint(*frame_type)?;
                b.put_varint(reason.len() as u64)?;
                b.put_bytes(reason.as_ref())?;
            },

            Frame::ApplicationClose { error_code, reason } => {
                b.put_varint(0x1d)?;

                b.put_varint(*error_code)?;
                b.put_varint(reason.len() as u64)?;
                b.put_bytes(reason.as_ref())?;
            },

            Frame::HandshakeDone => {
                b.put_varint(0x1e)?;
            },

            Frame::Datagram { data } => {
                b.put_varint(0x31)?;

                // Always encode length field as 2-byte varint.
                b.put_varint_with_len(data.len() as u64, 2)?;
                b.put_bytes(data)?;
            },

            Frame::MinStreamData {
                stream_id,
                maximum_data,
                minimum_stream_offset,
            } => {
                b.put_varint(0xfe)?;

                b.put_varint(*stream_id)?;
                b.put_varint(*maximum_data)?;
                b.put_varint(*minimum_stream_offset)?;
            },

            Frame::ExpiredStreamData {
                stream_id,
                minimum_stream_offset,
            } => {
                b.put_varint(0xff)?;

                b.put_varint(*stream_id)?;
                b.put_varint(*minimum_stream_offset)?;
            },
        }

        Ok(before - b.cap())
    }

    pub fn wire_len(&self) -> usize {
        match self {
            Frame::Padding { len } => *len,

            Frame::Ping => 1,

            Frame::Ack {
                ack_delay,
                ranges,
                ecn_counts,
            } => {
                let mut it = ranges.iter().rev();

                let first = it.next().unwrap();
                let ack_block = (first.end - 1) - first.start;

                let mut len = 1 + // frame type
                    octets::varint_len(first.end - 1) + // largest_ack
                    octets::varint_len(
                        ack_delay >> DEFAULT_ACK_DELAY_EXPONENT,
                    ) + // ack_delay
                    octets::varint_len(it.len() as u64) + // block_count
                    octets::varint_len(ack_block); // first_block

                let mut smallest_ack = first.start;

                for block in it {
                    let gap = smallest_ack - block.end - 1;
                    let ack_block = (block.end - 1) - block.start;

                    len += octets::varint_len(gap) + // gap
                           octets::varint_len(ack_block); // ack_block

                    smallest_ack = block.start;
                }

                if let Some(ecn) = ecn_counts {
                    len += octets::varint_len(ecn.ect0_count) +
                        octets::varint_len(ecn.ect1_count) +
                        octets::varint_len(ecn.ecn_ce_count);
                }

                len
            },

            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                1 + // frame type
                octets::varint_len(*stream_id) + // stream_id
                octets::varint_len(*error_code) + // error_code
                octets::varint_len(*final_size) // final_size
            },

            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                1 + // frame type
                octets::varint_len(*stream_id) + // stream_id
                octets::varint_len(*error_code) // error_code
            },

            Frame::Crypto { offset, data } => {
                1 + // frame type
                octets::varint_len(*offset) + // offset
                2 + // length, always encode as 2-byte varint
                data.len() // data
            },

            Frame::NewToken { token } => {
                1 + // frame type
                octets::varint_len(token.len() as u64) + // token length
                token.len() // token
            },

            Frame::Stream {
                stream_id,
                offset,
                data,
                ..
            } => {
                1 + // frame type
                octets::varint_len(*stream_id) + // stream_id
                octets::varint_len(*offset) + // offset
                2 + // length, always encode as 2-byte varint
                data.len() // data
            },

            Frame::MaxData { max } => {
                1 + // frame type
                octets::varint_len(*max) // max
            },

            Frame::MaxStreamData { stream_id, max } => {
                1 + // frame type
                octets::varint_len(*stream_id) + // stream_id
                octets::varint_len(*max) // max
            },

            Frame::MaxStreamsBidi { max } => {
                1 + // frame type
                octets::varint_len(*max) // max
            },

            Frame::MaxStreamsUni { max } => {
                1 + // frame type
                octets::varint_len(*max) // max
            },

            Frame::DataBlocked { limit } => {
                1 + // frame type
                octets::varint_len(*limit) // limit
            },

            Frame::StreamDataBlocked { stream_id, limit } => {
                1 + // frame type
                octets::varint_len(*stream_id) + // stream_id
                octets::varint_len(*limit) // limit
            },

            Frame::StreamsBlockedBidi { limit } => {
                1 + // frame type
                octets::varint_len(*limit) // limit
            },

            Frame::StreamsBlockedUni { limit } => {
                1 + // frame type
                octets::varint_len(*limit) // limit
            },

            Frame::NewConnectionId {
                seq_num,
                retire_prior_to,
                conn_id,
                reset_token,
            } => {
                1 + // frame type
                octets::varint_len(*seq_num) + // seq_num
                octets::varint_len(*retire_prior_to) + // retire_prior_to
                1 + // conn_id length
                conn_id.len() + // conn_id
                reset_token.len() // reset_token
            },

            Frame::RetireConnectionId { seq_num } => {
                1 + // frame type
                octets::varint_len(*seq_num) // seq_num
            },

            Frame::PathChallenge { .. } => {
                1 + // frame type
                8 // data
            },

            Frame::PathResponse { .. } => {
                1 + // frame type
                8 // data
            },

            Frame::ConnectionClose {
                frame_type,
                error_code,
                reason,
            } => {
                1 + // frame type
                octets::varint_len(*error_code) + // error_code
                octets::varint_len(*frame_type) + // triggering frame type
                octets::varint_len(reason.len() as u64) + // reason_len
                reason.len() // reason
            },

            Frame::ApplicationClose { reason, error_code } => {
                1 + // frame type
                octets::varint_len(*error_code) + // error_code
                octets::varint_len(reason.len() as u64) + // reason_len
                reason.len() // reason
            },

            Frame::HandshakeDone => {
                1 // frame type
            },

            Frame::Datagram { data } => {
                1 + // frame type
                2 + // length, always encode as 2-byte varint
                data.len() // data
            },

            Frame::MinStreamData {
                stream_id,
                maximum_data,
                minimum_stream_offset,
            } => {
                2 + // frame type
                octets::varint_len(*stream_id) + // stream_id
                octets::varint_len(*maximum_data) + // maximum_data
                octets::varint_len(*minimum_stream_offset) // min offset
            },

            Frame::ExpiredStreamData {
                stream_id,
                minimum_stream_offset,
            } => {
                2 + // frame type
                octets::varint_len(*stream_id) + // stream_id
                octets::varint_len(*minimum_stream_offset) // min offset
            },
        }
    }
}

impl std::fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Frame::Padding { len } => {
                write!(f, "PADDING len={len}")?;
            },

            Frame::Ping => {
                write!(f, "PING")?;
            },

            Frame::Ack {
                ack_delay,
                ranges,
                ecn_counts,
            } => {
                write!(
                    f,
                    "ACK delay={ack_delay} blocks={ranges:?} ecn_counts={ecn_counts:?}",
                )?;
            },

            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                write!(
                    f,
                    "RESET_STREAM stream={stream_id} err={error_code:x} size={final_size}",
                )?;
            },

            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                write!(f, "STOP_SENDING stream={stream_id} err={error_code:x}")?;
            },

            Frame::Crypto { offset, data } => {
                write!(f, "CRYPTO off={offset} len={}", data.len())?;
            },

            Frame::NewToken { token } => {
                write!(f, "NEW_TOKEN len={}", token.len())?;
            },

            Frame::Stream {
                stream_id,
                offset,
                fin,
                data,
            } => {
                write!(
                    f,
                    "STREAM id={stream_id} off={offset} len={} fin={fin}",
                    data.len(),
                )?;
            },

            Frame::MaxData { max } => {
                write!(f, "MAX_DATA max={max}")?;
            },

            Frame::MaxStreamData { stream_id, max } => {
                write!(f, "MAX_STREAM_DATA stream={stream_id} max={max}")?;
            },

            Frame::MaxStreamsBidi { max } => {
                write!(f, "MAX_STREAMS type=bidi max={max}")?;
            },

            Frame::MaxStreamsUni { max } => {
                write!(f, "MAX_STREAMS type=uni max={max}")?;
            },

            Frame::DataBlocked { limit } => {
                write!(f, "DATA_BLOCKED limit={limit}")?;
            },

            Frame::StreamDataBlocked { stream_id, limit } => {
                write!(f, "STREAM_DATA_BLOCKED stream={stream_id} limit={limit}")?;
            },

            Frame::StreamsBlockedBidi { limit } => {
                write!(f, "STREAMS_BLOCKED type=bidi limit={limit}")?;
            },

            Frame::StreamsBlockedUni { limit } => {
                write!(f, "STREAMS_BLOCKED type=uni limit={limit}")?;
            },

            Frame::NewConnectionId {
                seq_num,
                retire_prior_to,
                conn_id,
                reset_token,
            } => {
                write!(
                    f,
                    "NEW_CONNECTION_ID seq_num={seq_num} retire_prior_to={retire_prior_to} conn_id={conn_id:02x?} reset_token={reset_token:02x?}",
                )?;
            },

            Frame::RetireConnectionId { seq_num } => {
                write!(f, "RETIRE_CONNECTION_ID seq_num={seq_num}")?;
            },

            Frame::PathChallenge { data } => {
                write!(f, "PATH_CHALLENGE data={data:02x?}")?;
            },

            Frame::PathResponse { data } => {
                write!(f, "PATH_RESPONSE data={data:02x?}")?;
            },

            Frame::ConnectionClose {
                error_code,
                frame_type,
                reason,
            } => {
                write!(
                    f,
                    "CONNECTION_CLOSE err={error_code:x} frame={frame_type:x} reason={reason:x?}",
                )?;
            },

            Frame::ApplicationClose { error_code, reason } => {
                write!(f, "APPLICATION_CLOSE err={error_code:x} reason={reason:x?}")?;
            },

            Frame::HandshakeDone => {
                write!(f, "HANDSHAKE_DONE")?;
            },

            Frame::Datagram { data } => {
                write!(f, "DATAGRAM len={}", data.len())?;
            },

            Frame::MinStreamData {
                stream_id,
                maximum_data,
                minimum_stream_offset,
            } => {
                write!(
                    f,
                    "MIN_STREAM_DATA stream={stream_id} max_data={maximum_data} min_off={minimum_stream_offset}",
                )?;
            },

            Frame::ExpiredStreamData {
                stream_id,
                minimum_stream_offset,
            } => {
                write!(
                    f,
                    "EXPIRED_STREAM_DATA stream={stream_id} min_off={minimum_stream_offset}",
                )?;
            },
        }

        Ok(())
    }
}

fn parse_frame<'a>(
    frame_type: u64, b: &mut octets::Octets<'a>, pkt: packet::Type,
    params: &CodecParams,
) -> Result<Frame<'a>> {
    let frame = match frame_type {
        0x00 => {
            let mut len = 1;

            while b.peek_u8() == Ok(0x00) {
                b.get_u8()?;

                len += 1;
            }

            Frame::Padding { len }
        },

        0x01 => Frame::Ping,

        0x02..=0x03 => parse_ack_frame(frame_type, b, pkt, params)?,

        0x04 => Frame::ResetStream {
            stream_id: b.get_varint()?,
            error_code: b.get_varint()?,
            final_size: b.get_varint()?,
        },

        0x05 => Frame::StopSending {
            stream_id: b.get_varint()?,
            error_code: b.get_varint()?,
        },

        0x06 => Frame::Crypto {
            offset: b.get_varint()?,
            data: b.get_bytes_with_varint_length()?.buf(),
        },

        0x07 => Frame::NewToken {
            token: b.get_bytes_with_varint_length()?.buf(),
        },

        0x08..=0x0f => parse_stream_frame(frame_type, b)?,

        0x10 => Frame::MaxData {
            max: b.get_varint()?,
        },

        0x11 => Frame::MaxStreamData {
            stream_id: b.get_varint()?,
            max: b.get_varint()?,
        },

        0x12 => Frame::MaxStreamsBidi {
            max: b.get_varint()?,
        },

        0x13 => Frame::MaxStreamsUni {
            max: b.get_varint()?,
        },

        0x14 => Frame::DataBlocked {
            limit: b.get_varint()?,
        },

        0x15 => Frame::StreamDataBlocked {
            stream_id: b.get_varint()?,
            limit: b.get_varint()?,
        },

        0x16 => Frame::StreamsBlockedBidi {
            limit: b.get_varint()?,
        },

        0x17 => Frame::StreamsBlockedUni {
            limit: b.get_varint()?,
        },

        0x18 => {
            let seq_num = b.get_varint()?;
            let retire_prior_to = b.get_varint()?;
            let conn_id = b.get_bytes_with_u8_length()?;

            if conn_id.len() > crate::MAX_CONN_ID_LEN {
                return Err(Error::InvalidFrame(frame_type));
            }

            Frame::NewConnectionId {
                seq_num,
                retire_prior_to,
                conn_id: conn_id.to_vec(),
                reset_token: b
                    .get_bytes(16)?
                    .buf()
                    .try_into()
                    .map_err(|_| Error::BufferTooShort)?,
            }
        },

        0x19 => Frame::RetireConnectionId {
            seq_num: b.get_varint()?,
        },

        0x1a => Frame::PathChallenge {
            data: b
                .get_bytes(8)?
                .buf()
                .try_into()
                .map_err(|_| Error::BufferTooShort)?,
        },

        0x1b => Frame::PathResponse {
            data: b
                .get_bytes(8)?
                .buf()
                .try_into()
                .map_err(|_| Error::BufferTooShort)?,
        },

        0x1c => {
            let error_code = b.get_varint()?;

            // The triggering frame type must be encoded minimally, in a
            // single byte.
            let before = b.off();
            let trigger_frame_type = b.get_varint()?;

            if b.off() - before != 1 {
                return Err(Error::InvalidFrame(frame_type));
            }

            let reason_len = b.get_varint()?;

            if reason_len > MAX_REASON_LEN {
                return Err(Error::InvalidFrame(frame_type));
            }

            Frame::ConnectionClose {
                error_code,
                frame_type: trigger_frame_type,
                reason: b.get_bytes(reason_len as usize)?.to_vec(),
            }
        },

        0x1d => {
            let error_code = b.get_varint()?;
            let reason_len = b.get_varint()?;

            if reason_len > MAX_REASON_LEN {
                return Err(Error::InvalidFrame(frame_type));
            }

            Frame::ApplicationClose {
                error_code,
                reason: b.get_bytes(reason_len as usize)?.to_vec(),
            }
        },

        0x1e => Frame::HandshakeDone,

        0x30 | 0x31 => parse_datagram_frame(frame_type, b)?,

        0xfe => Frame::MinStreamData {
            stream_id: b.get_varint()?,
            maximum_data: b.get_varint()?,
            minimum_stream_offset: b.get_varint()?,
        },

        0xff => Frame::ExpiredStreamData {
            stream_id: b.get_varint()?,
            minimum_stream_offset: b.get_varint()?,
        },

        _ => return Err(Error::InvalidFrame(frame_type)),
    };

    Ok(frame)
}

fn parse_ack_frame<'a>(
    ty: u64, b: &mut octets::Octets, pkt: packet::Type, params: &CodecParams,
) -> Result<Frame<'a>> {
    let first = ty as u8;

    let largest_ack = b.get_varint()?;
    let ack_delay = b.get_varint()?;
    let block_count = b.get_varint()?;
    let ack_block = b.get_varint()?;

    // Before an exponent is negotiated the peer has to use the default, so
    // the protocol pins the default for every long header packet.
    let ack_delay_exponent = if pkt == packet::Type::Short {
        params.peer_ack_delay_exponent
    } else {
        DEFAULT_ACK_DELAY_EXPONENT
    };

    debug_assert!(ack_delay_exponent < 64);

    // Reject delays whose scaled value overflows the microsecond range.
    if ack_delay_exponent > 0 && ack_delay >> (64 - ack_delay_exponent) != 0 {
        return Err(Error::InvalidFrame(ty));
    }

    let ack_delay = ack_delay << ack_delay_exponent;

    if ack_delay > i64::MAX as u64 {
        return Err(Error::InvalidFrame(ty));
    }

    if largest_ack < ack_block {
        return Err(Error::InvalidFrame(ty));
    }

    let mut smallest_ack = largest_ack - ack_block;

    let mut ranges = ranges::RangeSet::default();

    ranges.insert(smallest_ack..largest_ack + 1);

    for _i in 0..block_count {
        let gap = b.get_varint()?;

        if smallest_ack < 2 + gap {
            return Err(Error::InvalidFrame(ty));
        }

        let largest_ack = (smallest_ack - gap) - 2;
        let ack_block = b.get_varint()?;

        if largest_ack < ack_block {
            return Err(Error::InvalidFrame(ty));
        }

        smallest_ack = largest_ack - ack_block;

        ranges.insert(smallest_ack..largest_ack + 1);
    }

    let ecn_counts = if first & 0x01 != 0 {
        let ecn = EcnCounts {
            ect0_count: b.get_varint()?,
            ect1_count: b.get_varint()?,
            ecn_ce_count: b.get_varint()?,
        };

        Some(ecn)
    } else {
        None
    };

    Ok(Frame::Ack {
        ack_delay,
        ranges,
        ecn_counts,
    })
}

fn parse_stream_frame<'a>(
    ty: u64, b: &mut octets::Octets<'a>,
) -> Result<Frame<'a>> {
    let first = ty as u8;

    let stream_id = b.get_varint()?;

    let offset = if first & 0x04 != 0 {
        b.get_varint()?
    } else {
        0
    };

    let len = if first & 0x02 != 0 {
        b.get_varint()? as usize
    } else {
        b.cap()
    };

    if offset + len as u64 >= MAX_STREAM_SIZE {
        return Err(Error::InvalidFrame(ty));
    }

    let fin = first & 0x01 != 0;

    let data = b.get_bytes(len)?.buf();

    Ok(Frame::Stream {
        stream_id,
        offset,
        fin,
        data,
    })
}

fn parse_datagram_frame<'a>(
    ty: u64, b: &mut octets::Octets<'a>,
) -> Result<Frame<'a>> {
    let first = ty as u8;

    let len = if first & 0x01 != 0 {
        b.get_varint()? as usize
    } else {
        b.cap()
    };

    let data = b.get_bytes(len)?.buf();

    Ok(Frame::Datagram { data })
}
