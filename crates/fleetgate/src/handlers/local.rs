//! The RPC surface as served on an agent's loopback listener, backed by the
//! local use-cases. The server's proxy router forwards to these handlers
//! over the reverse tunnel.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use fleet_core::strng;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, ReadHalf, SimplexStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::{DeleteOptions, Gvr, LogOptions, WatchEvent, WatchEventType};
use crate::errors::Error;
use crate::handlers::{RpcError, require_user, scrub, scrub_object, stream_response};
use crate::resource::{ResourceUseCase, WatchParams};
use crate::rpc::paths;
use crate::rpc::types::{
	ApplyRequest, CreateRequest, DeleteRequest, DescribeResponse, DiscoveryRequest,
	DiscoveryResponse, Empty, ExecOutput, ExecuteTtyRequest, GetRequest, ListRequest, LogChunk,
	ObjectResponse, PodLogRequest, PortForwardMessage, PortForwardRequest, ResizeTtyRequest,
	ResourceRef, RestartRequest, ScaleRequest, SchemaRequest, SchemaResponse, WatchRequest,
	WritePortForwardRequest, WriteTtyRequest,
};
use crate::runtime::{ExecParams, PortForwardParams, RuntimeUseCase};

#[derive(Clone)]
pub struct AgentState {
	pub resource: Arc<ResourceUseCase>,
	pub runtime: Arc<RuntimeUseCase>,
}

pub fn router(state: AgentState) -> axum::Router {
	axum::Router::new()
		.route(paths::RESOURCE_DISCOVERY, post(discovery))
		.route(paths::RESOURCE_SCHEMA, post(schema))
		.route(paths::RESOURCE_LIST, post(list))
		.route(paths::RESOURCE_GET, post(get))
		.route(paths::RESOURCE_DESCRIBE, post(describe))
		.route(paths::RESOURCE_CREATE, post(create))
		.route(paths::RESOURCE_APPLY, post(apply))
		.route(paths::RESOURCE_DELETE, post(delete))
		.route(paths::RESOURCE_WATCH, post(watch))
		.route(paths::RUNTIME_POD_LOG, post(pod_log))
		.route(paths::RUNTIME_EXECUTE_TTY, post(execute_tty))
		.route(paths::RUNTIME_PORT_FORWARD, post(port_forward))
		.route(paths::RUNTIME_WRITE_TTY, post(write_tty))
		.route(paths::RUNTIME_RESIZE_TTY, post(resize_tty))
		.route(paths::RUNTIME_WRITE_PORT_FORWARD, post(write_port_forward))
		.route(paths::RUNTIME_SCALE, post(scale))
		.route(paths::RUNTIME_RESTART, post(restart))
		.with_state(state)
}

fn gvr(target: &ResourceRef) -> Gvr {
	Gvr::new(
		strng::new(&target.group),
		strng::new(&target.version),
		strng::new(&target.resource),
	)
}

fn session_id(raw: &str) -> Result<Uuid, RpcError> {
	// A malformed id cannot name a live session.
	Uuid::parse_str(raw).map_err(|_| RpcError::from(Error::SessionNotFound))
}

async fn discovery(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(_req): Json<DiscoveryRequest>,
) -> Result<Json<DiscoveryResponse>, RpcError> {
	let user = require_user(user)?;
	let resources = state.resource.server_resources(&user).await?;
	Ok(Json(DiscoveryResponse { resources }))
}

async fn schema(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<SchemaRequest>,
) -> Result<Json<SchemaResponse>, RpcError> {
	require_user(user)?;
	let schema = state
		.resource
		.resolve_schema(&req.group, &req.version, &req.kind)
		.await?;
	Ok(Json(SchemaResponse { schema }))
}

async fn list(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<ListRequest>,
) -> Result<Json<ObjectResponse>, RpcError> {
	let user = require_user(user)?;
	let mut object = state
		.resource
		.list(
			&user,
			&gvr(&req.target),
			req.target.namespace.as_deref(),
			req.options,
		)
		.await?;
	scrub(&mut object);
	Ok(Json(ObjectResponse { object }))
}

async fn get(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<GetRequest>,
) -> Result<Json<ObjectResponse>, RpcError> {
	let user = require_user(user)?;
	let mut object = state
		.resource
		.get(
			&user,
			&gvr(&req.target),
			req.target.namespace.as_deref(),
			&req.name,
		)
		.await?;
	scrub_object(&mut object);
	Ok(Json(ObjectResponse { object }))
}

async fn describe(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<GetRequest>,
) -> Result<Json<DescribeResponse>, RpcError> {
	let user = require_user(user)?;
	let mut described = state
		.resource
		.describe(
			&user,
			&gvr(&req.target),
			req.target.namespace.as_deref(),
			&req.name,
		)
		.await?;
	scrub_object(&mut described.object);
	Ok(Json(DescribeResponse {
		object: described.object,
		events: described.events,
	}))
}

async fn create(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<CreateRequest>,
) -> Result<Json<ObjectResponse>, RpcError> {
	let user = require_user(user)?;
	let mut object = state
		.resource
		.create(
			&user,
			&gvr(&req.target),
			req.target.namespace.as_deref(),
			req.object,
		)
		.await?;
	scrub_object(&mut object);
	Ok(Json(ObjectResponse { object }))
}

async fn apply(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<ApplyRequest>,
) -> Result<Json<ObjectResponse>, RpcError> {
	let user = require_user(user)?;
	let mut object = state
		.resource
		.apply(
			&user,
			&gvr(&req.target),
			req.target.namespace.as_deref(),
			&req.yaml,
			req.force,
			req.field_manager.as_deref(),
		)
		.await?;
	scrub_object(&mut object);
	Ok(Json(ObjectResponse { object }))
}

async fn delete(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<DeleteRequest>,
) -> Result<Json<Empty>, RpcError> {
	let user = require_user(user)?;
	state
		.resource
		.delete(
			&user,
			&gvr(&req.target),
			req.target.namespace.as_deref(),
			&req.name,
			DeleteOptions {
				grace_period_seconds: req.grace_period_seconds,
			},
		)
		.await?;
	Ok(Json(Empty {}))
}

async fn watch(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<WatchRequest>,
) -> Result<Response, RpcError> {
	let user = require_user(user)?;
	let mut watcher = state
		.resource
		.watch(
			&user,
			&gvr(&req.target),
			req.target.namespace.as_deref(),
			WatchParams {
				label_selector: req.label_selector,
				field_selector: req.field_selector,
				resource_version: req.resource_version,
			},
		)
		.await?;

	let stream = async_stream::stream! {
		while let Some(mut event) = watcher.recv().await {
			if matches!(
				event.event_type,
				WatchEventType::Added | WatchEventType::Modified | WatchEventType::Deleted
			) {
				scrub_object(&mut event.object);
			}
			yield Ok::<WatchEvent, Error>(event);
		}
		// The upstream watch ended; tell the consumer to resume from its
		// last observed resource version.
		yield Err(Error::unavailable("watch closed"));
	};
	Ok(stream_response(stream.boxed()))
}

async fn pod_log(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<PodLogRequest>,
) -> Result<Response, RpcError> {
	let user = require_user(user)?;
	let logs = state
		.runtime
		.pod_log(
			&user,
			&req.namespace,
			&req.name,
			LogOptions {
				container: req.container,
				follow: req.follow,
				tail_lines: req.tail_lines,
				since_seconds: req.since_seconds,
				previous: req.previous,
				timestamps: req.timestamps,
			},
		)
		.await?;
	let stream = logs.map(|chunk| chunk.map(|data| LogChunk { data: data.to_vec() }));
	Ok(stream_response(stream.boxed()))
}

async fn execute_tty(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<ExecuteTtyRequest>,
) -> Result<Response, RpcError> {
	let user = require_user(user)?;
	let start = state.runtime.start_exec(
		&user,
		ExecParams {
			namespace: req.namespace,
			pod: req.name,
			container: req.container,
			command: req.command,
			tty: req.tty,
			initial_rows: req.rows,
			initial_cols: req.cols,
		},
	)?;

	let session_id = start.session_id;
	let stdout = start.stdout;
	let stderr = start.stderr;
	// Constructed outside the generator so cleanup runs even if the
	// response body is dropped before it is ever polled.
	let guard = CleanupGuard {
		runtime: state.runtime.clone(),
		id: session_id,
		kind: SessionKind::Exec,
	};
	let stream = async_stream::stream! {
		let _guard = guard;
		yield Ok::<ExecOutput, Error>(ExecOutput {
			session_id: Some(session_id.to_string()),
			..Default::default()
		});

		let (tx, mut rx) = mpsc::channel::<ExecOutput>(16);
		spawn_pipe_reader(stdout, tx.clone(), |data| ExecOutput {
			stdout: Some(data),
			..Default::default()
		});
		if let Some(stderr) = stderr {
			spawn_pipe_reader(stderr, tx.clone(), |data| ExecOutput {
				stderr: Some(data),
				..Default::default()
			});
		}
		drop(tx);
		while let Some(out) = rx.recv().await {
			yield Ok(out);
		}
	};
	Ok(stream_response(stream.boxed()))
}

async fn port_forward(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<PortForwardRequest>,
) -> Result<Response, RpcError> {
	let user = require_user(user)?;
	let start = state.runtime.start_port_forward(
		&user,
		PortForwardParams {
			namespace: req.namespace,
			pod: req.name,
			port: req.port,
		},
	)?;

	let session_id = start.session_id;
	let mut output = start.output;
	let guard = CleanupGuard {
		runtime: state.runtime.clone(),
		id: session_id,
		kind: SessionKind::PortForward,
	};
	let stream = async_stream::stream! {
		let _guard = guard;
		yield Ok::<PortForwardMessage, Error>(PortForwardMessage {
			session_id: Some(session_id.to_string()),
			..Default::default()
		});
		let mut buf = vec![0u8; 16 * 1024];
		loop {
			match output.read(&mut buf).await {
				Ok(0) | Err(_) => break,
				Ok(n) => {
					yield Ok(PortForwardMessage {
						data: Some(buf[..n].to_vec()),
						..Default::default()
					});
				},
			}
		}
	};
	Ok(stream_response(stream.boxed()))
}

async fn write_tty(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<WriteTtyRequest>,
) -> Result<Json<Empty>, RpcError> {
	require_user(user)?;
	let id = session_id(&req.session_id)?;
	state.runtime.write_exec(&id, &req.stdin).await?;
	Ok(Json(Empty {}))
}

async fn resize_tty(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<ResizeTtyRequest>,
) -> Result<Json<Empty>, RpcError> {
	require_user(user)?;
	let id = session_id(&req.session_id)?;
	state.runtime.resize_exec(&id, req.rows, req.cols)?;
	Ok(Json(Empty {}))
}

async fn write_port_forward(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<WritePortForwardRequest>,
) -> Result<Json<Empty>, RpcError> {
	require_user(user)?;
	let id = session_id(&req.session_id)?;
	state.runtime.write_port_forward(&id, &req.data).await?;
	Ok(Json(Empty {}))
}

async fn scale(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<ScaleRequest>,
) -> Result<Json<Empty>, RpcError> {
	let user = require_user(user)?;
	state
		.runtime
		.scale(
			&user,
			&gvr(&req.target),
			req.target.namespace.as_deref(),
			&req.name,
			req.replicas,
		)
		.await?;
	Ok(Json(Empty {}))
}

async fn restart(
	State(state): State<AgentState>,
	user: Option<axum::Extension<crate::identity::UserInfo>>,
	Json(req): Json<RestartRequest>,
) -> Result<Json<Empty>, RpcError> {
	let user = require_user(user)?;
	state
		.runtime
		.restart(
			&user,
			&gvr(&req.target),
			req.target.namespace.as_deref(),
			&req.name,
		)
		.await?;
	Ok(Json(Empty {}))
}

#[derive(Clone, Copy)]
enum SessionKind {
	Exec,
	PortForward,
}

/// Runs session cleanup when the response stream is dropped, whether the
/// client finished cleanly or vanished mid-stream.
struct CleanupGuard {
	runtime: Arc<RuntimeUseCase>,
	id: Uuid,
	kind: SessionKind,
}

impl Drop for CleanupGuard {
	fn drop(&mut self) {
		let runtime = self.runtime.clone();
		let id = self.id;
		let kind = self.kind;
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				match kind {
					SessionKind::Exec => runtime.cleanup_exec(&id).await,
					SessionKind::PortForward => runtime.cleanup_port_forward(&id).await,
				}
			});
		}
	}
}

fn spawn_pipe_reader<F>(
	mut pipe: ReadHalf<SimplexStream>,
	tx: mpsc::Sender<ExecOutput>,
	wrap: F,
) where
	F: Fn(Vec<u8>) -> ExecOutput + Send + 'static,
{
	tokio::spawn(async move {
		let mut buf = vec![0u8; 16 * 1024];
		loop {
			match pipe.read(&mut buf).await {
				Ok(0) | Err(_) => return,
				Ok(n) => {
					if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
						return;
					}
				},
			}
		}
	});
}
