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

use foundations::settings::settings;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;
use std::time::Duration;

/// Routing worker configuration parameters.
#[serde_as]
#[settings]
pub struct WorkerSettings {
    /// QUIC versions this server speaks, in preference order. The list is
    /// echoed verbatim in version negotiation replies.
    #[serde(default = "WorkerSettings::default_supported_versions")]
    pub supported_versions: Vec<u32>,

    /// Identity of this host within its deployment, matched against the
    /// host id recovered from short header destination CIDs.
    pub host_id: u16,

    /// Identity of this server process during takeover, `0` or `1`.
    pub process_id: u8,

    /// Index of this worker within the server.
    pub worker_id: u8,

    /// Secret keying stateless reset tokens, 32 bytes. Resets are only
    /// emitted when this is set.
    pub stateless_reset_secret: Option<Vec<u8>>,

    /// When set, any datagram whose payload equals this token is answered
    /// with the literal bytes `OK` and not processed further.
    pub health_check_token: Option<Vec<u8>>,

    /// The peer's negotiated `ack_delay_exponent`, applied when decoding
    /// ACK frames from short header packets. Must be below 64.
    #[serde(default = "WorkerSettings::default_peer_ack_delay_exponent")]
    pub peer_ack_delay_exponent: u8,

    /// The largest UDP payload this worker emits. Clamps version
    /// negotiation and stateless reset replies, and the packet builder
    /// budget handed to transports.
    #[serde(default = "WorkerSettings::default_max_udp_payload")]
    pub max_udp_payload: u16,

    /// Refuse to create connections for new Initial packets. A fast-path
    /// admission veto for load shedding and graceful drains.
    pub reject_new_connections: bool,

    /// Queue depth of each connection's inbound datagram channel.
    #[serde(default = "WorkerSettings::default_incoming_queue_len")]
    pub incoming_queue_len: usize,

    /// How long a retired CID keeps absorbing in-flight datagrams before
    /// its routing entry is forgotten entirely.
    #[serde(
        rename = "rejected_cid_grace_ms",
        default = "WorkerSettings::default_rejected_cid_grace"
    )]
    #[serde_as(as = "Option<DurationMilliSeconds>")]
    pub rejected_cid_grace: Option<Duration>,
}

impl WorkerSettings {
    fn default_supported_versions() -> Vec<u32> {
        vec![quix::PROTOCOL_VERSION]
    }

    fn default_peer_ack_delay_exponent() -> u8 {
        quix::frame::DEFAULT_ACK_DELAY_EXPONENT
    }

    fn default_max_udp_payload() -> u16 {
        1350
    }

    fn default_incoming_queue_len() -> usize {
        2048
    }

    fn default_rejected_cid_grace() -> Option<Duration> {
        Some(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = WorkerSettings::default();

        assert_eq!(settings.supported_versions, [quix::PROTOCOL_VERSION]);
        assert_eq!(settings.peer_ack_delay_exponent, 3);
        assert_eq!(settings.max_udp_payload, 1350);
        assert_eq!(settings.rejected_cid_grace, Some(Duration::from_secs(10)));
        assert!(!settings.reject_new_connections);
        assert!(settings.stateless_reset_secret.is_none());
    }
}
