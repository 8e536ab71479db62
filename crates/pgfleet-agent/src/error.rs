// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent error types.

use pgfleet_protocol::client::ClientError;
use pgfleet_protocol::frame::FrameError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("missing required environment variable: {var}")]
    MissingConfig { var: String },

    #[error("invalid value for {var}: {message}")]
    InvalidConfig { var: String, message: String },

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("local PostgreSQL error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Registration rejected for a reason reconnecting cannot fix.
    #[error("registration rejected ({code}): {message}")]
    Rejected { code: String, message: String },

    /// Error reported by the coordinator; worth retrying.
    #[error("coordinator error ({code}): {message}")]
    Coordinator { code: String, message: String },
}

impl AgentError {
    /// Whether reconnecting is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Rejected { .. }
                | AgentError::MissingConfig { .. }
                | AgentError::InvalidConfig { .. }
        )
    }
}
