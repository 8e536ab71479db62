// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent-facing QUIC endpoint.
//!
//! Two calls arrive here. `Register` opens the long-lived task stream: after
//! the ack, the coordinator pushes tasks down it until the agent disconnects
//! or a newer registration for the same instance takes over. `NotifyDbStatus`
//! is a plain unary call on a fresh stream.

use std::sync::Arc;

use pgfleet_protocol::fleet_proto::{
    NotifyDbStatusRequest, NotifyDbStatusResponse, RegisterAck, RegisterRequest, RpcRequest,
    RpcResponse, rpc_request,
};
use pgfleet_protocol::frame::{Frame, read_frame, write_frame};
use pgfleet_protocol::server::{ConnectionHandler, FleetServer, ServerError, StreamHandler};
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{AgentAuthenticator, StaticTokenAuthenticator};
use crate::error::CoreError;
use crate::registry::{DbStatusEvent, InstanceRegistry, Registration};
use crate::store::TaskStore;

/// Shared state for every agent connection.
pub struct AgentServerState {
    pub registry: Arc<InstanceRegistry>,
    pub auth: Arc<dyn AgentAuthenticator>,
    pub store: Arc<dyn TaskStore>,
}

/// Accept agent connections until the endpoint closes.
pub async fn run_agent_server(
    server: FleetServer,
    state: Arc<AgentServerState>,
) -> Result<(), ServerError> {
    server
        .run(move |conn: ConnectionHandler| {
            let state = state.clone();
            async move {
                conn.run(move |stream| {
                    let state = state.clone();
                    async move { handle_stream(stream, state).await }
                })
                .await;
            }
        })
        .await
}

async fn handle_stream(mut stream: StreamHandler, state: Arc<AgentServerState>) {
    let frame = match stream.read_frame().await {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "stream ended before a request arrived");
            return;
        }
    };
    let request: RpcRequest = match frame.decode() {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "undecodable request frame");
            respond_error(&mut stream, "VALIDATION_ERROR", &e.to_string()).await;
            return;
        }
    };

    match request.request {
        Some(rpc_request::Request::Register(req)) => handle_register(stream, state, req).await,
        Some(rpc_request::Request::NotifyDbStatus(req)) => {
            handle_notify(stream, state, req).await
        }
        None => {
            respond_error(&mut stream, "VALIDATION_ERROR", "empty request envelope").await;
        }
    }
}

/// Registration plus the task-serving loop for one agent connection.
#[instrument(skip_all, fields(instance = %req.instance_name))]
async fn handle_register(
    mut stream: StreamHandler,
    state: Arc<AgentServerState>,
    req: RegisterRequest,
) {
    let identity = match state.auth.authenticate(&req.token) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(code = e.error_code(), "registration rejected");
            respond_error(&mut stream, e.error_code(), &e.to_string()).await;
            return;
        }
    };
    if let Err(e) = StaticTokenAuthenticator::authorize(&identity, &req.instance_name) {
        warn!(code = e.error_code(), "registration rejected");
        respond_error(&mut stream, e.error_code(), &e.to_string()).await;
        return;
    }

    let mut seeds = Vec::with_capacity(req.databases.len());
    for wire in &req.databases {
        match DbStatusEvent::from_wire(wire) {
            Ok(event) => seeds.push(event),
            Err(e) => warn!(db = %wire.name, error = %e, "skipping undecodable seed state"),
        }
    }

    let registration = state
        .registry
        .register(&req.instance_name, &req.pg_version, seeds);

    let ack = RpcResponse::register(RegisterAck {
        success: true,
        error: String::new(),
    });
    let ack_frame = match Frame::response(&ack) {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, "cannot encode registration ack");
            return;
        }
    };
    if let Err(e) = stream.write_frame(&ack_frame).await {
        warn!(error = %e, "agent vanished before the ack");
        state
            .registry
            .mark_offline(&req.instance_name, registration.epoch);
        return;
    }

    serve_tasks(stream, state, &req.instance_name, registration).await;
}

/// Push tasks down the registration stream until it dies or is superseded.
async fn serve_tasks(
    stream: StreamHandler,
    state: Arc<AgentServerState>,
    instance: &str,
    registration: Registration,
) {
    let epoch = registration.epoch;
    let mut rx = registration.receiver;
    let (mut send, mut recv) = stream.into_parts();

    // The agent never writes on this stream after registering, so any read
    // completion means the peer went away.
    let (closed_tx, mut closed_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = read_frame(&mut recv).await;
        let _ = closed_tx.send(());
    });

    loop {
        // Parked task first: it was pulled off the queue before a failed
        // write and must not be overtaken.
        let task = match state.registry.take_resend(instance, epoch) {
            Some(task) => task,
            None => {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(task) => task,
                        None => {
                            debug!(instance, epoch, "registration superseded");
                            return;
                        }
                    },
                    _ = &mut closed_rx => {
                        info!(instance, "agent stream closed");
                        state.registry.mark_offline(instance, epoch);
                        return;
                    }
                }
            }
        };

        let frame = match Frame::stream_data(&task) {
            Ok(frame) => frame,
            Err(e) => {
                error!(task_id = %task.task_id, error = %e, "cannot encode task push");
                continue;
            }
        };
        if let Err(e) = write_frame(&mut send, &frame).await {
            warn!(instance, task_id = %task.task_id, error = %e, "push failed, parking task");
            state.registry.park_resend(instance, task);
            state.registry.mark_offline(instance, epoch);
            return;
        }
        debug!(instance, task_id = %task.task_id, "task pushed");
    }
}

#[instrument(skip_all, fields(instance = %req.instance_name))]
async fn handle_notify(
    mut stream: StreamHandler,
    state: Arc<AgentServerState>,
    req: NotifyDbStatusRequest,
) {
    let auth_result = state
        .auth
        .authenticate(&req.token)
        .and_then(|identity| {
            StaticTokenAuthenticator::authorize(&identity, &req.instance_name)
        });
    if let Err(e) = auth_result {
        warn!(code = e.error_code(), "status report rejected");
        respond_error(&mut stream, e.error_code(), &e.to_string()).await;
        return;
    }

    let response = match apply_notify(&state, &req).await {
        Ok(fresh) => {
            if fresh {
                debug!("status report applied");
            }
            NotifyDbStatusResponse {
                success: true,
                error: String::new(),
            }
        }
        Err(e) => {
            warn!(code = e.error_code(), error = %e, "status report not applied");
            NotifyDbStatusResponse {
                success: false,
                error: e.to_string(),
            }
        }
    };

    respond(&mut stream, &RpcResponse::notify_db_status(response)).await;
}

async fn apply_notify(
    state: &AgentServerState,
    req: &NotifyDbStatusRequest,
) -> Result<bool, CoreError> {
    let wire = req.state.as_ref().ok_or_else(|| CoreError::ValidationError {
        field: "state".to_string(),
        message: "status report carries no database state".to_string(),
    })?;
    let event = DbStatusEvent::from_wire(wire)?;
    let fresh = state.registry.apply_db_status(event.clone())?;

    // Mirror fresh agent-side changes into the coordinator's record. A
    // report for a database the coordinator never provisioned is cache-only.
    if fresh
        && let Some(db) = state
            .store
            .get_database(&event.instance_name, &event.name)
            .await?
    {
        state
            .store
            .update_database_state(&db.id, event.stage, event.status, event.error_msg.as_deref())
            .await?;
    }
    Ok(fresh)
}

async fn respond(stream: &mut StreamHandler, response: &RpcResponse) {
    match Frame::response(response) {
        Ok(frame) => {
            if let Err(e) = stream.write_frame(&frame).await {
                debug!(error = %e, "response write failed");
            }
            let _ = stream.finish();
        }
        Err(e) => error!(error = %e, "cannot encode response"),
    }
}

async fn respond_error(stream: &mut StreamHandler, code: &str, message: &str) {
    match Frame::error(&RpcResponse::error(code, message)) {
        Ok(frame) => {
            if let Err(e) = stream.write_frame(&frame).await {
                debug!(error = %e, "error response write failed");
            }
            let _ = stream.finish();
        }
        Err(e) => error!(error = %e, "cannot encode error response"),
    }
}
