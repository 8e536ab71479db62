// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC-facing side of the coordinator.

mod agent_server;

pub use agent_server::{AgentServerState, run_agent_server};
