pub mod fleet;
pub mod forward;
pub mod local;

use std::convert::Infallible;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use http::header::CONTENT_TYPE;
use serde::Serialize;

use crate::errors::{Code, DomainError, Error};
use crate::identity::UserInfo;
use crate::rpc::{Frame, RpcStatus, STREAM_CONTENT_TYPE, http_status};

/// The edge of the error taxonomy: a domain error rendered as a transport
/// response. Handlers return this; nothing below them ever sees HTTP.
#[derive(Debug)]
pub struct RpcError(pub Error);

impl From<Error> for RpcError {
	fn from(e: Error) -> Self {
		RpcError(e)
	}
}

impl From<crate::errors::DomainError> for RpcError {
	fn from(e: crate::errors::DomainError) -> Self {
		RpcError(e.into())
	}
}

impl IntoResponse for RpcError {
	fn into_response(self) -> Response {
		let status = RpcStatus::from_error(&self.0);
		let body = serde_json::to_vec(&status).unwrap_or_else(|_| b"{}".to_vec());
		Response::builder()
			.status(http_status(status.code))
			.header(CONTENT_TYPE, "application/json")
			.body(Body::from(body))
			.expect("static response")
	}
}

/// Pulls the authenticated caller out of request extensions. The auth
/// middleware is the only producer; its absence means the route was wired
/// outside the boundary, which must read as unauthenticated, not a 500.
pub(crate) fn require_user(user: Option<axum::Extension<UserInfo>>) -> Result<UserInfo, RpcError> {
	user
		.map(|e| e.0)
		.ok_or_else(|| DomainError::new(Code::Unauthenticated, "no authenticated caller").into())
}

/// Strips noisy server-managed metadata before objects reach users:
/// `metadata.managedFields` and the kubectl last-applied annotation. If the
/// annotation map ends up empty it is removed entirely. Applied in the
/// handler layer only; the domain keeps objects untouched.
pub fn scrub_object(object: &mut serde_json::Value) {
	let Some(metadata) = object.get_mut("metadata").and_then(|m| m.as_object_mut()) else {
		return;
	};
	metadata.remove("managedFields");
	let remove_annotations = match metadata
		.get_mut("annotations")
		.and_then(|a| a.as_object_mut())
	{
		Some(annotations) => {
			annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
			annotations.is_empty()
		},
		None => false,
	};
	if remove_annotations {
		metadata.remove("annotations");
	}
}

/// Scrubs a whole list (`items`) or a single object.
pub fn scrub(value: &mut serde_json::Value) {
	if let Some(items) = value.get_mut("items").and_then(|i| i.as_array_mut()) {
		for item in items {
			scrub_object(item);
		}
		return;
	}
	scrub_object(value);
}

fn frame_line<T: Serialize>(frame: &Frame<T>) -> Bytes {
	let mut line = serde_json::to_vec(frame).unwrap_or_else(|_| b"{}".to_vec());
	line.push(b'\n');
	Bytes::from(line)
}

/// Renders a typed stream as a `application/jsonl` response body. An error
/// becomes the terminal frame.
pub fn stream_response<T: Serialize + Send + 'static>(
	items: BoxStream<'static, Result<T, Error>>,
) -> Response {
	let mut items = items;
	let body = async_stream::stream! {
		while let Some(item) = items.next().await {
			match item {
				Ok(value) => yield Ok::<Bytes, Infallible>(frame_line(&Frame::value(value))),
				Err(e) => {
					yield Ok(frame_line(&Frame::<T>::error(&e)));
					break;
				},
			}
		}
	};
	Response::builder()
		.status(http::StatusCode::OK)
		.header(CONTENT_TYPE, STREAM_CONTENT_TYPE)
		.body(Body::from_stream(body))
		.expect("static response")
}
