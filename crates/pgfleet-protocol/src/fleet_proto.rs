// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages exchanged between the coordinator and instance agents.
//!
//! Stage, status and action values travel as their canonical string forms;
//! `pgfleet-core` owns the closed enums and their parsing.

/// Snapshot of one managed database as an agent sees it.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DatabaseState {
    /// Database name, unique within an instance.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Role that owns the database.
    #[prost(string, tag = "2")]
    pub owner: String,
    /// Instance the database lives on.
    #[prost(string, tag = "3")]
    pub instance_name: String,
    /// Lifecycle stage (canonical string form, e.g. "ready_to_use").
    #[prost(string, tag = "4")]
    pub stage: String,
    /// Processing status of the current stage (e.g. "done").
    #[prost(string, tag = "5")]
    pub status: String,
    /// Source instance when the database was migrated in.
    #[prost(string, optional, tag = "6")]
    pub migrate_from: Option<String>,
    /// Destination instance when the database is migrating out.
    #[prost(string, optional, tag = "7")]
    pub migrate_to: Option<String>,
    /// Retention deadline after migrate-out, Unix millis.
    #[prost(int64, optional, tag = "8")]
    pub expired_at_ms: Option<i64>,
    /// Last modification time, Unix millis. Used for change deduplication.
    #[prost(int64, tag = "9")]
    pub updated_at_ms: i64,
    /// Failure detail when status is "failed".
    #[prost(string, optional, tag = "10")]
    pub error_msg: Option<String>,
}

/// Agent registration, sent as the first frame on the long-lived task stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterRequest {
    /// Bearer token scoped to this instance.
    #[prost(string, tag = "1")]
    pub token: String,
    /// Instance the agent manages.
    #[prost(string, tag = "2")]
    pub instance_name: String,
    /// PostgreSQL server version string reported by the agent.
    #[prost(string, tag = "3")]
    pub pg_version: String,
    /// Databases the agent currently knows about, to seed the coordinator cache.
    #[prost(message, repeated, tag = "4")]
    pub databases: Vec<DatabaseState>,
}

/// Acknowledgement for [`RegisterRequest`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterAck {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error: String,
}

/// One task delivered to an agent over the registration stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TaskPush {
    #[prost(string, tag = "1")]
    pub task_id: String,
    #[prost(string, tag = "2")]
    pub job_id: String,
    #[prost(string, tag = "3")]
    pub db_name: String,
    #[prost(string, tag = "4")]
    pub instance_name: String,
    /// Action in canonical string form (e.g. "migrate_out").
    #[prost(string, tag = "5")]
    pub action: String,
    #[prost(string, optional, tag = "6")]
    pub owner: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub password: Option<String>,
    /// Instance to take the source dump from, for restore actions.
    #[prost(string, optional, tag = "8")]
    pub backup_from: Option<String>,
    /// Dump file location, for backup and restore actions.
    #[prost(string, optional, tag = "9")]
    pub backup_path: Option<String>,
    /// Operator-supplied reason, for migrate-out and cancellation.
    #[prost(string, optional, tag = "10")]
    pub reason: Option<String>,
}

/// Database status report, sent by agents on a fresh unary stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NotifyDbStatusRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub instance_name: String,
    #[prost(message, optional, tag = "3")]
    pub state: Option<DatabaseState>,
}

/// Acknowledgement for [`NotifyDbStatusRequest`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct NotifyDbStatusResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error: String,
}

/// Error detail carried in error frames and error responses.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcError {
    /// Stable machine-readable code (e.g. "UNAUTHENTICATED").
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Envelope for all agent-to-coordinator calls.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcRequest {
    #[prost(oneof = "rpc_request::Request", tags = "1, 2")]
    pub request: Option<rpc_request::Request>,
}

pub mod rpc_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Register(super::RegisterRequest),
        #[prost(message, tag = "2")]
        NotifyDbStatus(super::NotifyDbStatusRequest),
    }
}

/// Envelope for coordinator responses.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Response", tags = "1, 2, 3")]
    pub response: Option<rpc_response::Response>,
}

pub mod rpc_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        Register(super::RegisterAck),
        #[prost(message, tag = "2")]
        NotifyDbStatus(super::NotifyDbStatusResponse),
        #[prost(message, tag = "3")]
        Error(super::RpcError),
    }
}

impl RpcRequest {
    /// Wrap a registration request in the call envelope.
    pub fn register(req: RegisterRequest) -> Self {
        Self {
            request: Some(rpc_request::Request::Register(req)),
        }
    }

    /// Wrap a status notification in the call envelope.
    pub fn notify_db_status(req: NotifyDbStatusRequest) -> Self {
        Self {
            request: Some(rpc_request::Request::NotifyDbStatus(req)),
        }
    }
}

impl RpcResponse {
    pub fn register(ack: RegisterAck) -> Self {
        Self {
            response: Some(rpc_response::Response::Register(ack)),
        }
    }

    pub fn notify_db_status(resp: NotifyDbStatusResponse) -> Self {
        Self {
            response: Some(rpc_response::Response::NotifyDbStatus(resp)),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            response: Some(rpc_response::Response::Error(RpcError {
                code: code.into(),
                message: message.into(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_register_request_round_trip() {
        let req = RegisterRequest {
            token: "tok-1".to_string(),
            instance_name: "pg-eu-1".to_string(),
            pg_version: "16.3".to_string(),
            databases: vec![DatabaseState {
                name: "shop".to_string(),
                owner: "shop_owner".to_string(),
                instance_name: "pg-eu-1".to_string(),
                stage: "ready_to_use".to_string(),
                status: "done".to_string(),
                migrate_from: None,
                migrate_to: None,
                expired_at_ms: None,
                updated_at_ms: 1_700_000_000_000,
                error_msg: None,
            }],
        };
        let bytes = req.encode_to_vec();
        let decoded = RegisterRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn test_task_push_optional_fields_default_absent() {
        let push = TaskPush {
            task_id: "t1".to_string(),
            job_id: "j1".to_string(),
            db_name: "shop".to_string(),
            instance_name: "pg-eu-1".to_string(),
            action: "create_user".to_string(),
            ..Default::default()
        };
        let decoded = TaskPush::decode(push.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.owner, None);
        assert_eq!(decoded.backup_path, None);
        assert_eq!(decoded.action, "create_user");
    }

    #[test]
    fn test_rpc_request_oneof_dispatch() {
        let req = RpcRequest::register(RegisterRequest {
            token: "tok".to_string(),
            instance_name: "pg-1".to_string(),
            pg_version: "15.2".to_string(),
            databases: vec![],
        });
        let decoded = RpcRequest::decode(req.encode_to_vec().as_slice()).unwrap();
        match decoded.request {
            Some(rpc_request::Request::Register(r)) => assert_eq!(r.instance_name, "pg-1"),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_rpc_response_error_helper() {
        let resp = RpcResponse::error("UNAUTHENTICATED", "bad token");
        match resp.response {
            Some(rpc_response::Response::Error(e)) => {
                assert_eq!(e.code, "UNAUTHENTICATED");
                assert_eq!(e.message, "bad token");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_notify_with_state_round_trip() {
        let req = NotifyDbStatusRequest {
            token: "tok".to_string(),
            instance_name: "pg-1".to_string(),
            state: Some(DatabaseState {
                name: "shop".to_string(),
                owner: "shop_owner".to_string(),
                instance_name: "pg-1".to_string(),
                stage: "idle".to_string(),
                status: "processing".to_string(),
                migrate_from: None,
                migrate_to: Some("pg-2".to_string()),
                expired_at_ms: Some(1_700_000_123_456),
                updated_at_ms: 1_700_000_000_001,
                error_msg: None,
            }),
        };
        let decoded = NotifyDbStatusRequest::decode(req.encode_to_vec().as_slice()).unwrap();
        let state = decoded.state.unwrap();
        assert_eq!(state.migrate_to.as_deref(), Some("pg-2"));
        assert_eq!(state.expired_at_ms, Some(1_700_000_123_456));
    }
}
