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

//! Metrics for tokio-quix.
//!
//! Deployments that run their own registry can implement [`Metrics`];
//! everyone else uses [`DefaultMetrics`], which reports into the process-wide
//! [foundations](https://docs.rs/foundations) registry.

pub mod labels;

use foundations::telemetry::metrics::metrics;
use foundations::telemetry::metrics::Counter;

use self::labels::DropReason;

/// Metrics recorded by the routing worker.
pub trait Metrics: Clone + Send + Sync + Unpin + 'static {
    /// Datagrams dropped without being delivered, by reason.
    fn dropped_datagram_count(&self, reason: DropReason) -> Counter;

    /// Initial packets that created a new connection.
    fn accepted_initial_packet_count(&self) -> Counter;

    /// Stateless reset datagrams written back to peers.
    fn stateless_reset_count(&self) -> Counter;

    /// Version negotiation replies sent.
    fn version_negotiation_count(&self) -> Counter;

    /// Datagrams wrapped and forwarded to the takeover sibling.
    fn forwarded_packet_count(&self) -> Counter;

    /// Forwarded datagrams received from the takeover sibling.
    fn forwarded_packet_received_count(&self) -> Counter;

    /// Health check probes answered.
    fn health_check_count(&self) -> Counter;
}

#[metrics]
pub(crate) mod worker {
    /// Number of datagrams dropped without delivery, by reason
    pub fn dropped_datagram_count(reason: DropReason) -> Counter;

    /// Number of Initial packets that created a new connection
    pub fn accepted_initial_packet_count() -> Counter;

    /// Number of stateless reset datagrams written back to peers
    pub fn stateless_reset_count() -> Counter;

    /// Number of version negotiation replies sent
    pub fn version_negotiation_count() -> Counter;

    /// Number of datagrams forwarded to the takeover sibling
    pub fn forwarded_packet_count() -> Counter;

    /// Number of forwarded datagrams received from the takeover sibling
    pub fn forwarded_packet_received_count() -> Counter;

    /// Number of health check probes answered
    pub fn health_check_count() -> Counter;
}

/// The standard [`Metrics`] implementation, backed by the global foundations
/// registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultMetrics;

impl Metrics for DefaultMetrics {
    fn dropped_datagram_count(&self, reason: DropReason) -> Counter {
        worker::dropped_datagram_count(reason)
    }

    fn accepted_initial_packet_count(&self) -> Counter {
        worker::accepted_initial_packet_count()
    }

    fn stateless_reset_count(&self) -> Counter {
        worker::stateless_reset_count()
    }

    fn version_negotiation_count(&self) -> Counter {
        worker::version_negotiation_count()
    }

    fn forwarded_packet_count(&self) -> Counter {
        worker::forwarded_packet_count()
    }

    fn forwarded_packet_received_count(&self) -> Counter {
        worker::forwarded_packet_received_count()
    }

    fn health_check_count(&self) -> Counter {
        worker::health_check_count()
    }
}
