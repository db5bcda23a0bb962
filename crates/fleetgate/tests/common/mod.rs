//! In-process server + agent pair over real loopback sockets: a full CA,
//! tunnel listener, reverse-tunnel agent, and stub Kubernetes backend.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use bytes::Bytes;
use fleet_core::strng;
use fleetgate::authn::OidcVerifier;
use fleetgate::backend::testing::StubBackend;
use fleetgate::config::ManifestConfig;
use fleetgate::discovery::DiscoveryCache;
use fleetgate::fleet::FleetUseCase;
use fleetgate::handlers::local::AgentState;
use fleetgate::pki::{Ca, CsrOptions, MANIFEST_TOKEN_LABEL};
use fleetgate::proxy::{AlwaysLeader, RpcProxy};
use fleetgate::resource::{BackendSchemaFetcher, ResourceUseCase};
use fleetgate::rpc::types::{RegisterRequest, RegisterResponse};
use fleetgate::rpc::{RpcClient, paths, shared_transport};
use fleetgate::runtime::RuntimeUseCase;
use fleetgate::runtime::session::SessionStore;
use fleetgate::serve::{ServerParts, agent_router, serve, server_router};
use fleetgate::telemetry::Metrics;
use fleetgate::tunnel::{
	AgentTunnel, AgentTunnelConfig, TunnelListener, TunnelOptions, TunnelProvider,
};
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;

pub const OIDC_SECRET: &[u8] = b"integration-test-oidc-secret-32b";
pub const ISSUER: &str = "https://issuer.test";
pub const CLIENT_ID: &str = "fleet";

pub struct Harness {
	pub server_url: String,
	pub tunnel_addr: std::net::SocketAddr,
	pub backend: Arc<StubBackend>,
	pub store: Arc<SessionStore>,
	pub hmac_key: [u8; 32],
	pub ca_cert_pem: String,
	pub shutdown: CancellationToken,
	http: hyper_util::client::legacy::Client<
		hyper_util::client::legacy::connect::HttpConnector,
		http_body_util::Full<Bytes>,
	>,
}

impl Drop for Harness {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

fn jwks() -> jsonwebtoken::jwk::JwkSet {
	serde_json::from_value(serde_json::json!({
		"keys": [{
			"kty": "oct",
			"kid": "it-key",
			"alg": "HS256",
			"k": URL_SAFE_NO_PAD.encode(OIDC_SECRET),
		}]
	}))
	.expect("static JWKS")
}

/// A signed OIDC ID token for `subject`, valid for ten minutes.
pub fn bearer_token(subject: &str) -> String {
	let exp = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap()
		.as_secs() as i64
		+ 600;
	let mut header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
	header.kid = Some("it-key".into());
	jsonwebtoken::encode(
		&header,
		&serde_json::json!({
			"iss": ISSUER,
			"aud": CLIENT_ID,
			"sub": subject,
			"exp": exp,
		}),
		&jsonwebtoken::EncodingKey::from_secret(OIDC_SECRET),
	)
	.expect("token encodes")
}

/// Hand-built manifest token with chosen timestamps, signed with the
/// server's derived HMAC key; exercises the wire format from outside.
pub fn forge_manifest_token(
	key: &[u8; 32],
	sub: &str,
	cluster: &str,
	iat: i64,
	exp: i64,
) -> String {
	let payload =
		serde_json::to_vec(&serde_json::json!({"sub": sub, "cluster": cluster, "iat": iat, "exp": exp}))
			.unwrap();
	let hmac_key = aws_lc_rs::hmac::Key::new(aws_lc_rs::hmac::HMAC_SHA256, key);
	let sig = aws_lc_rs::hmac::sign(&hmac_key, &payload);
	format!(
		"{}.{}",
		URL_SAFE_NO_PAD.encode(&payload),
		URL_SAFE_NO_PAD.encode(sig.as_ref())
	)
}

impl Harness {
	/// Starts the full server: CA, tunnel listener, public RPC listener.
	pub async fn start() -> Harness {
		let ca = Arc::new(Ca::generate().expect("CA generates"));
		let ca_cert_pem = ca.cert_pem().to_string();
		let hmac_key = ca.derive_hmac_key(MANIFEST_TOKEN_LABEL).expect("HMAC key");
		let metrics = Arc::new(Metrics::new());
		let provider = TunnelProvider::new(ca, TunnelOptions::default(), metrics.clone());

		let tunnel_listener = TunnelListener::bind(provider.clone(), "127.0.0.1:0".parse().unwrap())
			.await
			.expect("tunnel listener binds");
		let tunnel_addr = tunnel_listener.local_addr();

		let fleet = Arc::new(
			FleetUseCase::new(
				provider.clone(),
				&hmac_key,
				&ManifestConfig {
					server_url: "https://fleet.example.com".into(),
					tunnel_url: format!("{tunnel_addr}"),
				},
				None,
			)
			.expect("fleet use-case"),
		);
		let proxy = Arc::new(RpcProxy::new(
			provider.clone(),
			Arc::new(AlwaysLeader),
			metrics.clone(),
		));
		let verifier =
			Arc::new(OidcVerifier::from_jwks(jwks(), ISSUER, CLIENT_ID).expect("verifier"));
		let router = server_router(ServerParts {
			fleet,
			proxy,
			verifier,
			metrics: metrics.clone(),
			allowed_origins: Vec::new(),
		})
		.expect("router");

		let rpc_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
			.await
			.expect("rpc listener binds");
		let server_url = format!("http://{}", rpc_listener.local_addr().unwrap());

		let shutdown = CancellationToken::new();
		tokio::spawn(tunnel_listener.run(shutdown.clone()));
		tokio::spawn(serve(rpc_listener, router, shutdown.clone()));

		Harness {
			server_url,
			tunnel_addr,
			backend: Arc::new(StubBackend::default()),
			store: Arc::new(SessionStore::new(Arc::new(Metrics::new()))),
			hmac_key,
			ca_cert_pem,
			shutdown,
			http: shared_transport(),
		}
	}

	/// Registers `cluster` and connects a live agent over the tunnel.
	pub async fn connect_agent(&self, cluster: &str, agent_id: &str) -> RegisterResponse {
		// The agent's loopback RPC listener, backed by the stub cluster.
		let cache = DiscoveryCache::new(
			BackendSchemaFetcher::new(self.backend.clone()),
			Duration::from_secs(60),
		);
		let resource = Arc::new(ResourceUseCase::new(
			self.backend.clone(),
			cache,
			strng::new(cluster),
		));
		let runtime = Arc::new(RuntimeUseCase::new(
			self.backend.clone(),
			self.store.clone(),
		));
		let local_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let local_addr = local_listener.local_addr().unwrap();
		let router = agent_router(AgentState { resource, runtime });
		tokio::spawn(serve(local_listener, router, self.shutdown.clone()));

		let csr = CsrOptions {
			common_name: agent_id.to_string(),
		}
		.generate()
		.expect("CSR generates");
		let registration = self
			.register(cluster, agent_id, &csr.csr_pem)
			.await
			.expect("registration succeeds");

		let tunnel = AgentTunnel::new(AgentTunnelConfig {
			cluster: cluster.to_string(),
			agent_id: agent_id.to_string(),
			tunnel_addr: self.tunnel_addr.to_string(),
			server_name: "localhost".to_string(),
			ca_cert_pem: registration.ca_cert_pem.clone(),
			cert_pem: registration.cert_pem.clone(),
			key_pem: csr.key_pem.clone(),
			local_addr,
		})
		.expect("agent tunnel");
		tokio::spawn(tunnel.run(self.shutdown.clone()));

		registration
	}

	pub async fn register(
		&self,
		cluster: &str,
		agent_id: &str,
		csr_pem: &str,
	) -> Result<RegisterResponse, fleetgate::Error> {
		let client = RpcClient::new(self.http.clone(), self.server_url.as_str());
		client
			.unary(
				paths::FLEET_REGISTER,
				&RegisterRequest {
					cluster: cluster.to_string(),
					agent_id: agent_id.to_string(),
					agent_version: "it".to_string(),
					csr_pem: csr_pem.to_string(),
				},
				None,
			)
			.await
	}

	/// Raw RPC POST with an optional bearer token; returns status and body.
	pub async fn post(
		&self,
		path: &str,
		bearer: Option<&str>,
		body: serde_json::Value,
	) -> (http::StatusCode, Bytes) {
		let mut builder = http::Request::builder()
			.method(http::Method::POST)
			.uri(format!("{}{}", self.server_url, path))
			.header(http::header::CONTENT_TYPE, "application/json");
		if let Some(token) = bearer {
			builder = builder.header(
				http::header::AUTHORIZATION,
				format!("Bearer {token}"),
			);
		}
		let request = builder
			.body(http_body_util::Full::new(Bytes::from(
				serde_json::to_vec(&body).unwrap(),
			)))
			.unwrap();
		let response = self.http.request(request).await.expect("request sends");
		let status = response.status();
		let bytes = response
			.into_body()
			.collect()
			.await
			.expect("body reads")
			.to_bytes();
		(status, bytes)
	}

	pub async fn get(&self, path: &str) -> (http::StatusCode, Bytes) {
		let request = http::Request::builder()
			.method(http::Method::GET)
			.uri(format!("{}{}", self.server_url, path))
			.body(http_body_util::Full::new(Bytes::new()))
			.unwrap();
		let response = self.http.request(request).await.expect("request sends");
		let status = response.status();
		let bytes = response
			.into_body()
			.collect()
			.await
			.expect("body reads")
			.to_bytes();
		(status, bytes)
	}

	/// Opens a server-stream and returns a line-based reader over it.
	pub async fn post_stream(
		&self,
		path: &str,
		bearer: &str,
		body: serde_json::Value,
	) -> StreamReader {
		let request = http::Request::builder()
			.method(http::Method::POST)
			.uri(format!("{}{}", self.server_url, path))
			.header(http::header::CONTENT_TYPE, "application/json")
			.header(http::header::AUTHORIZATION, format!("Bearer {bearer}"))
			.body(http_body_util::Full::new(Bytes::from(
				serde_json::to_vec(&body).unwrap(),
			)))
			.unwrap();
		let response = self.http.request(request).await.expect("request sends");
		assert_eq!(
			response.status(),
			http::StatusCode::OK,
			"stream open failed"
		);
		StreamReader {
			body: response.into_body(),
			buf: Vec::new(),
		}
	}

	pub fn basic_header(user: &str, password: &str) -> String {
		format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
	}
}

/// Incremental reader for jsonl stream responses.
pub struct StreamReader {
	body: hyper::body::Incoming,
	buf: Vec<u8>,
}

impl StreamReader {
	/// Next decoded frame, or `None` at end of stream.
	pub async fn next_frame(&mut self) -> Option<serde_json::Value> {
		loop {
			if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
				let line: Vec<u8> = self.buf.drain(..=pos).collect();
				let line = &line[..line.len() - 1];
				if line.is_empty() {
					continue;
				}
				return Some(serde_json::from_slice(line).expect("frame is JSON"));
			}
			match self.body.frame().await {
				Some(Ok(frame)) => {
					if let Some(data) = frame.data_ref() {
						self.buf.extend_from_slice(data);
					}
				},
				_ => return None,
			}
		}
	}
}

/// Polls until `check` passes or the budget runs out.
pub async fn eventually<F: Fn() -> bool>(budget: Duration, check: F) -> bool {
	let deadline = tokio::time::Instant::now() + budget;
	loop {
		if check() {
			return true;
		}
		if tokio::time::Instant::now() > deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
}
