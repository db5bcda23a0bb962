use bytes::{Bytes, BytesMut};
use fleet_core::Strng;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{Code, DomainError, Error};
use crate::identity::UserInfo;
use crate::rpc::{Frame, RpcStatus, SUBJECT_HEADER};

/// One HTTP/1.1 pool shared by every upstream client. Deliberately has no
/// request timeout: watches, logs and exec streams are long-lived.
pub type SharedTransport = Client<HttpConnector, Full<Bytes>>;

/// TLS-capable transport for calls leaving the host (agent → server).
pub type TlsConnector = hyper_rustls::HttpsConnector<HttpConnector>;
pub type TlsTransport = Client<TlsConnector, Full<Bytes>>;

pub fn shared_transport() -> SharedTransport {
	Client::builder(TokioExecutor::new()).build_http()
}

pub fn tls_transport() -> Result<TlsTransport, Error> {
	let https = hyper_rustls::HttpsConnectorBuilder::new()
		.with_provider_and_native_roots(crate::tunnel::tls_provider())
		.map_err(|e| Error::internal(format!("TLS roots: {e}")))?
		.https_or_http()
		.enable_http1()
		.build();
	Ok(Client::builder(TokioExecutor::new()).build(https))
}

/// A typed client for one base URL. Carries no identity of its own; the
/// caller decides per request whether a subject header is attached.
#[derive(Clone)]
pub struct RpcClient<C = HttpConnector> {
	base: Strng,
	http: Client<C, Full<Bytes>>,
}

impl<C> std::fmt::Debug for RpcClient<C> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RpcClient").field("base", &self.base).finish()
	}
}

impl<C: Connect + Clone + Send + Sync + 'static> RpcClient<C> {
	pub fn new(http: Client<C, Full<Bytes>>, base: impl Into<Strng>) -> Self {
		RpcClient {
			base: base.into(),
			http,
		}
	}

	pub fn base(&self) -> &str {
		&self.base
	}

	fn build_request<Req: Serialize>(
		&self,
		path: &str,
		req: &Req,
		subject: Option<&str>,
	) -> Result<Request<Full<Bytes>>, Error> {
		let uri = format!("{}{}", self.base.trim_end_matches('/'), path);
		let body = serde_json::to_vec(req)
			.map_err(|e| DomainError::wrap(Code::Internal, "encode request", e.into()))?;
		let mut builder = Request::builder()
			.method(Method::POST)
			.uri(&uri)
			.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
		if let Some(subject) = subject {
			let value = HeaderValue::from_str(subject).map_err(|_| {
				Error::from(DomainError::new(
					Code::Unauthenticated,
					"subject is not header-safe",
				))
			})?;
			builder = builder.header(SUBJECT_HEADER, value);
		}
		builder
			.body(Full::new(Bytes::from(body)))
			.map_err(|e| DomainError::wrap(Code::Internal, "build request", e.into()).into())
	}

	pub async fn unary<Req: Serialize, Resp: DeserializeOwned>(
		&self,
		path: &str,
		req: &Req,
		subject: Option<&str>,
	) -> Result<Resp, Error> {
		let request = self.build_request(path, req, subject)?;
		let response = self
			.http
			.request(request)
			.await
			.map_err(|e| DomainError::wrap(Code::Unavailable, format!("call {path}"), e.into()))?;
		let status = response.status();
		let body = response
			.into_body()
			.collect()
			.await
			.map_err(|e| DomainError::wrap(Code::Unavailable, "read response", e.into()))?
			.to_bytes();
		if !status.is_success() {
			return Err(decode_status(status, &body));
		}
		serde_json::from_slice(&body)
			.map_err(|e| DomainError::wrap(Code::Internal, "decode response", e.into()).into())
	}

	/// Opens a server-stream and yields decoded frames. The stream ends on
	/// a terminal error frame, EOF, or when the returned stream is dropped
	/// (which tears the HTTP stream down with it).
	pub async fn streaming<Req: Serialize, Item: DeserializeOwned + Send + Default + 'static>(
		&self,
		path: &str,
		req: &Req,
		subject: Option<&str>,
	) -> Result<BoxStream<'static, Result<Item, Error>>, Error> {
		let request = self.build_request(path, req, subject)?;
		let response = self
			.http
			.request(request)
			.await
			.map_err(|e| DomainError::wrap(Code::Unavailable, format!("call {path}"), e.into()))?;
		let status = response.status();
		if !status.is_success() {
			let body = response
				.into_body()
				.collect()
				.await
				.map_err(|e| DomainError::wrap(Code::Unavailable, "read response", e.into()))?
				.to_bytes();
			return Err(decode_status(status, &body));
		}

		let mut body = response.into_body();
		let stream = async_stream::stream! {
			let mut buf = BytesMut::new();
			'read: loop {
				let frame = match body.frame().await {
					Some(Ok(f)) => f,
					Some(Err(e)) => {
						yield Err(Error::unavailable(format!("stream read: {e}")));
						break;
					},
					None => break,
				};
				let Some(data) = frame.data_ref() else {
					continue;
				};
				buf.extend_from_slice(data);
				while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
					let line = buf.split_to(pos + 1);
					let line = &line[..line.len() - 1];
					if line.is_empty() {
						continue;
					}
					match serde_json::from_slice::<Frame<Item>>(line) {
						Ok(Frame { error: Some(status), .. }) => {
							yield Err(status.into_error());
							break 'read;
						},
						Ok(Frame { value: Some(item), .. }) => yield Ok(item),
						Ok(_) => {},
						Err(e) => {
							yield Err(Error::from(DomainError::wrap(
								Code::Internal,
								"decode stream frame",
								e.into(),
							)));
							break 'read;
						},
					}
				}
			}
		};
		Ok(stream.boxed())
	}
}

/// The per-cluster upstream client the proxy caches: an `RpcClient` plus
/// the subject-propagation interceptor. Forwarding anonymously is a bug, so
/// a missing subject fails closed before any bytes leave the process.
#[derive(Clone, Debug)]
pub struct UpstreamClient {
	inner: RpcClient,
}

impl UpstreamClient {
	pub fn new(http: SharedTransport, base: impl Into<Strng>) -> Self {
		UpstreamClient {
			inner: RpcClient::new(http, base),
		}
	}

	pub fn base(&self) -> &str {
		self.inner.base()
	}

	fn subject<'a>(&self, user: Option<&'a UserInfo>) -> Result<&'a str, Error> {
		match user {
			Some(u) if !u.subject.trim().is_empty() => Ok(u.subject.as_str()),
			_ => Err(DomainError::new(
				Code::Unauthenticated,
				"no subject available for upstream call",
			)
			.into()),
		}
	}

	pub async fn unary<Req: Serialize, Resp: DeserializeOwned>(
		&self,
		user: Option<&UserInfo>,
		path: &str,
		req: &Req,
	) -> Result<Resp, Error> {
		let subject = self.subject(user)?;
		self.inner.unary(path, req, Some(subject)).await
	}

	pub async fn streaming<Req: Serialize, Item: DeserializeOwned + Send + Default + 'static>(
		&self,
		user: Option<&UserInfo>,
		path: &str,
		req: &Req,
	) -> Result<BoxStream<'static, Result<Item, Error>>, Error> {
		let subject = self.subject(user)?;
		self.inner.streaming(path, req, Some(subject)).await
	}
}

fn decode_status(status: http::StatusCode, body: &[u8]) -> Error {
	if let Ok(rpc) = serde_json::from_slice::<RpcStatus>(body) {
		return rpc.into_error();
	}
	let code = match status.as_u16() {
		400 => Code::InvalidArgument,
		401 => Code::Unauthenticated,
		403 => Code::PermissionDenied,
		404 => Code::NotFound,
		409 => Code::AlreadyExists,
		412 => Code::FailedPrecondition,
		429 => Code::ResourceExhausted,
		501 => Code::Unimplemented,
		503 => Code::Unavailable,
		504 => Code::DeadlineExceeded,
		_ => Code::Internal,
	};
	DomainError::new(code, format!("upstream returned HTTP {status}")).into()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn missing_subject_fails_closed_without_network() {
		// The base URL points nowhere routable; the call must fail before
		// any connection is attempted.
		let client = UpstreamClient::new(shared_transport(), "http://127.0.0.1:1");
		let err = client
			.unary::<_, serde_json::Value>(None, "/fleet.v1.Fleet/ListClusters", &())
			.await
			.unwrap_err();
		assert_eq!(err.code(), Code::Unauthenticated);

		let anonymous = UserInfo::new("");
		let err = client
			.unary::<_, serde_json::Value>(
				Some(&anonymous),
				"/fleet.v1.Fleet/ListClusters",
				&(),
			)
			.await
			.unwrap_err();
		assert_eq!(err.code(), Code::Unauthenticated);
	}

	#[test]
	fn status_decoding_prefers_body_code() {
		let body = serde_json::to_vec(&RpcStatus {
			code: Code::FailedPrecondition,
			message: "conflict".into(),
		})
		.unwrap();
		let err = decode_status(http::StatusCode::BAD_REQUEST, &body);
		assert_eq!(err.code(), Code::FailedPrecondition);

		let err = decode_status(http::StatusCode::SERVICE_UNAVAILABLE, b"gateway down");
		assert_eq!(err.code(), Code::Unavailable);
	}
}
