// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance agent: connects to the coordinator over QUIC, registers the
//! local PostgreSQL server and executes the tasks pushed down the stream.

pub mod agent;
pub mod config;
pub mod error;
pub mod executor;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::AgentError;
pub use executor::LocalExecutor;
