// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registration and the task stream.
//!
//! The agent holds one long-lived bidirectional stream to the coordinator:
//! register, read the ack, then keep reading pushed tasks. When the stream
//! dies it reconnects with a linearly growing delay, capped at 30 seconds
//! and reset after every successful registration.

use std::sync::Arc;
use std::time::Duration;

use pgfleet_protocol::FleetClient;
use pgfleet_protocol::fleet_proto::{
    RegisterRequest, RpcRequest, RpcResponse, TaskPush, rpc_response,
};
use pgfleet_protocol::frame::{Frame, MessageType};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::executor::LocalExecutor;

const MAX_BACKOFF_SECS: u64 = 30;

pub struct Agent {
    config: AgentConfig,
    client: Arc<FleetClient>,
    executor: Arc<LocalExecutor>,
}

impl Agent {
    pub fn new(config: AgentConfig, executor: Arc<LocalExecutor>) -> Result<Self, AgentError> {
        let client = Arc::new(FleetClient::new(config.client_config())?);
        Ok(Self {
            config,
            client,
            executor,
        })
    }

    /// Run until a fatal registration rejection.
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut attempt: u64 = 0;
        loop {
            match self.session(&mut attempt).await {
                Ok(()) => debug!("task stream ended"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "session ended"),
            }

            attempt += 1;
            let delay = backoff_secs(attempt);
            info!(attempt, delay_secs = delay, "reconnecting to coordinator");
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }

    /// One connection lifetime: register, then consume pushed tasks until
    /// the stream breaks.
    async fn session(&self, attempt: &mut u64) -> Result<(), AgentError> {
        self.client.connect().await?;
        let mut stream = self.client.open_stream().await?;

        let register = RpcRequest::register(RegisterRequest {
            token: self.config.token.clone(),
            instance_name: self.config.instance_name.clone(),
            pg_version: self.executor.pg_version().await?,
            databases: self.executor.snapshot(),
        });
        stream.write_frame(&Frame::request(&register)?).await?;

        let ack = stream.read_frame().await?;
        check_ack(&ack)?;
        info!(instance = %self.config.instance_name, "registered with coordinator");
        *attempt = 0;

        loop {
            let frame = stream.read_frame().await?;
            match frame.message_type {
                MessageType::StreamData => {
                    let push: TaskPush = frame.decode()?;
                    info!(task_id = %push.task_id, action = %push.action, db = %push.db_name, "task received");
                    let executor = self.executor.clone();
                    let client = self.client.clone();
                    tokio::spawn(async move {
                        executor.execute(&client, push).await;
                    });
                }
                other => warn!(message_type = ?other, "unexpected frame on task stream"),
            }
        }
    }
}

fn check_ack(frame: &Frame) -> Result<(), AgentError> {
    match frame.message_type {
        MessageType::Response => {
            let response: RpcResponse = frame.decode()?;
            match response.response {
                Some(rpc_response::Response::Register(ack)) if ack.success => Ok(()),
                Some(rpc_response::Response::Register(ack)) => Err(AgentError::Coordinator {
                    code: "REGISTRATION_FAILED".to_string(),
                    message: ack.error,
                }),
                other => Err(AgentError::Coordinator {
                    code: "PROTOCOL".to_string(),
                    message: format!("unexpected registration response: {:?}", other),
                }),
            }
        }
        MessageType::Error => {
            let response: RpcResponse = frame.decode()?;
            match response.response {
                Some(rpc_response::Response::Error(e))
                    if e.code == "UNAUTHENTICATED" || e.code == "PERMISSION_DENIED" =>
                {
                    Err(AgentError::Rejected {
                        code: e.code,
                        message: e.message,
                    })
                }
                Some(rpc_response::Response::Error(e)) => Err(AgentError::Coordinator {
                    code: e.code,
                    message: e.message,
                }),
                other => Err(AgentError::Coordinator {
                    code: "PROTOCOL".to_string(),
                    message: format!("undecodable error frame: {:?}", other),
                }),
            }
        }
        other => Err(AgentError::Coordinator {
            code: "PROTOCOL".to_string(),
            message: format!("unexpected frame type {:?} for registration ack", other),
        }),
    }
}

/// Linear backoff: one more second per attempt, capped.
fn backoff_secs(attempt: u64) -> u64 {
    attempt.clamp(1, MAX_BACKOFF_SECS)
}
