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

//! A QUIC connection-routing worker on top of tokio, built on the
//! [quix](quix) wire codec.
//!
//! A server binds one UDP socket per worker (typically with `SO_REUSEPORT`)
//! and spawns a [`RoutingWorker`] for each. The worker classifies every
//! inbound datagram and either routes it to the owning connection, creates a
//! new connection through a [`TransportFactory`], or answers it directly:
//! version negotiation for unknown versions, stateless resets for
//! unroutable short header packets, `OK` for health check probes.
//!
//! During a graceful takeover the worker can wrap datagrams that belong to a
//! sibling server process and relay them, preserving the original peer
//! address and receive time (see [`takeover`]).
//!
//! Each worker is single-threaded: routing tables are owned by the worker's
//! task, and connections talk back exclusively through message passing
//! ([`ConnectionControl`], [`WorkerHandle`]).
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_quix::metrics::DefaultMetrics;
//! use tokio_quix::settings::WorkerSettings;
//! use tokio_quix::RoutingWorker;
//!
//! # async fn example(factory: impl tokio_quix::TransportFactory + Unpin) -> std::io::Result<()> {
//! let socket = Arc::new(tokio::net::UdpSocket::bind("0.0.0.0:4433").await?);
//!
//! let (worker, handle) = RoutingWorker::new(
//!     socket,
//!     WorkerSettings::default(),
//!     factory,
//!     DefaultMetrics,
//! )?;
//!
//! tokio::spawn(worker);
//! # Ok(())
//! # }
//! ```

pub mod metrics;
pub mod settings;
pub mod takeover;

mod connection;
mod worker;

pub use crate::connection::CloseReason;
pub use crate::connection::ConnEvent;
pub use crate::connection::ConnectionControl;
pub use crate::connection::Incoming;
pub use crate::connection::TransportFactory;

pub use crate::worker::RoutingWorker;
pub use crate::worker::WorkerHandle;
