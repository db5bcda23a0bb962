//! The typed RPC convention shared by server, agent and proxy.
//!
//! Every method is `POST /<service>/<Method>` with a JSON body. Unary
//! responses are JSON; server-streams are newline-delimited JSON frames,
//! each `{"value": …}` or a terminal `{"error": {"code", "message"}}`.

mod client;
pub mod types;

pub use client::{RpcClient, SharedTransport, TlsConnector, TlsTransport, UpstreamClient, shared_transport, tls_transport};

use http::StatusCode;

use crate::errors::{Code, DomainError, Error};

/// Canonical method paths. The path is the routing key on both the public
/// listener and the agent's loopback listener.
pub mod paths {
	pub const FLEET_LIST_CLUSTERS: &str = "/fleet.v1.Fleet/ListClusters";
	pub const FLEET_REGISTER: &str = "/fleet.v1.Fleet/Register";
	pub const FLEET_GET_AGENT_MANIFEST: &str = "/fleet.v1.Fleet/GetAgentManifest";

	pub const RESOURCE_DISCOVERY: &str = "/resource.v1.Resource/Discovery";
	pub const RESOURCE_SCHEMA: &str = "/resource.v1.Resource/Schema";
	pub const RESOURCE_LIST: &str = "/resource.v1.Resource/List";
	pub const RESOURCE_GET: &str = "/resource.v1.Resource/Get";
	pub const RESOURCE_DESCRIBE: &str = "/resource.v1.Resource/Describe";
	pub const RESOURCE_CREATE: &str = "/resource.v1.Resource/Create";
	pub const RESOURCE_APPLY: &str = "/resource.v1.Resource/Apply";
	pub const RESOURCE_DELETE: &str = "/resource.v1.Resource/Delete";
	pub const RESOURCE_WATCH: &str = "/resource.v1.Resource/Watch";

	pub const RUNTIME_POD_LOG: &str = "/runtime.v1.Runtime/PodLog";
	pub const RUNTIME_EXECUTE_TTY: &str = "/runtime.v1.Runtime/ExecuteTTY";
	pub const RUNTIME_PORT_FORWARD: &str = "/runtime.v1.Runtime/PortForward";
	pub const RUNTIME_WRITE_TTY: &str = "/runtime.v1.Runtime/WriteTTY";
	pub const RUNTIME_RESIZE_TTY: &str = "/runtime.v1.Runtime/ResizeTTY";
	pub const RUNTIME_WRITE_PORT_FORWARD: &str = "/runtime.v1.Runtime/WritePortForward";
	pub const RUNTIME_SCALE: &str = "/runtime.v1.Runtime/Scale";
	pub const RUNTIME_RESTART: &str = "/runtime.v1.Runtime/Restart";
}

/// Trusted header carrying the caller subject across the reverse tunnel.
/// Only meaningful between the proxy and an agent's loopback listener.
pub const SUBJECT_HEADER: &str = "x-fleet-subject";

/// Media type of server-stream responses.
pub const STREAM_CONTENT_TYPE: &str = "application/jsonl";

/// Wire form of a failed RPC.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RpcStatus {
	pub code: Code,
	pub message: String,
}

impl RpcStatus {
	pub fn from_error(err: &Error) -> Self {
		RpcStatus {
			code: err.code(),
			message: err.to_string(),
		}
	}

	pub fn into_error(self) -> Error {
		DomainError::new(self.code, self.message).into()
	}
}

/// One frame on a server-stream.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Frame<T> {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub value: Option<T>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<RpcStatus>,
}

impl<T> Frame<T> {
	pub fn value(value: T) -> Self {
		Frame {
			value: Some(value),
			error: None,
		}
	}

	pub fn error(err: &Error) -> Self {
		Frame {
			value: None,
			error: Some(RpcStatus::from_error(err)),
		}
	}
}

/// HTTP status for a transport code, mirroring the Connect-RPC convention.
pub fn http_status(code: Code) -> StatusCode {
	match code {
		Code::InvalidArgument => StatusCode::BAD_REQUEST,
		Code::Unauthenticated => StatusCode::UNAUTHORIZED,
		Code::PermissionDenied => StatusCode::FORBIDDEN,
		Code::NotFound => StatusCode::NOT_FOUND,
		Code::AlreadyExists => StatusCode::CONFLICT,
		Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
		Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
		Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
		Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
		Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
		Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_roundtrips_through_json() {
		let status = RpcStatus {
			code: Code::NotFound,
			message: "cluster not found: dev".into(),
		};
		let json = serde_json::to_string(&status).unwrap();
		assert!(json.contains("\"not_found\""));
		let back: RpcStatus = serde_json::from_str(&json).unwrap();
		assert_eq!(back, status);
		assert_eq!(back.into_error().code(), Code::NotFound);
	}

	#[test]
	fn frame_shapes() {
		let frame = Frame::value(serde_json::json!({"x": 1}));
		let json = serde_json::to_string(&frame).unwrap();
		assert_eq!(json, r#"{"value":{"x":1}}"#);

		let frame: Frame<serde_json::Value> = Frame::error(&Error::SessionNotFound);
		let json = serde_json::to_string(&frame).unwrap();
		assert!(json.starts_with(r#"{"error":"#));
	}

	#[test]
	fn http_status_covers_all_codes() {
		assert_eq!(http_status(Code::InvalidArgument), StatusCode::BAD_REQUEST);
		assert_eq!(http_status(Code::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(http_status(Code::DeadlineExceeded), StatusCode::GATEWAY_TIMEOUT);
	}
}
