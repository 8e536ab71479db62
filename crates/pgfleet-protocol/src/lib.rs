// SPDX-License-Identifier: AGPL-3.0-or-later
//! pgfleet Protocol - QUIC + Protobuf communication layer
//!
//! This crate provides the wire protocol between instance agents and the
//! pgfleet coordinator.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    pgfleet-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: Request/Response + long-lived task stream       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Calls
//!
//! - `Register`: the agent opens one bidirectional stream, sends a
//!   [`fleet_proto::RegisterRequest`], receives a
//!   [`fleet_proto::RegisterAck`], and then keeps reading
//!   `StreamData` frames carrying [`fleet_proto::TaskPush`] until the
//!   stream closes.
//! - `NotifyDbStatus`: unary call on a fresh stream reporting one
//!   database's state back to the coordinator.
//!
//! # Usage
//!
//! ```ignore
//! use pgfleet_protocol::{FleetClient, fleet_proto};
//!
//! let client = FleetClient::localhost()?;
//! client.connect().await?;
//!
//! let request = fleet_proto::NotifyDbStatusRequest {
//!     token: "agent-token".to_string(),
//!     instance_name: "pg-eu-1".to_string(),
//!     state: Some(state),
//! };
//!
//! let response: fleet_proto::RpcResponse = client
//!     .request(&fleet_proto::RpcRequest::notify_db_status(request))
//!     .await?;
//! ```

pub mod client;
pub mod fleet_proto;
pub mod frame;
pub mod server;

// Re-export main types
pub use client::{ClientError, FleetClient, FleetClientConfig};
pub use frame::{BidiStream, Frame, FrameError, FramedStream, MessageType};
pub use server::{ConnectionHandler, FleetServer, FleetServerConfig, ServerError, StreamHandler};
