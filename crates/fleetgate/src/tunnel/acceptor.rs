use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::{Request, Response, StatusCode, header};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Error;
use crate::tunnel::provider::TunnelProvider;
use crate::tunnel::tls::tunnel_server_config;

/// Upgrade target on the tunnel listener.
pub const TUNNEL_PATH: &str = "/tunnel";
/// Protocol name announced in the Upgrade header.
pub const TUNNEL_PROTOCOL: &str = "fleet-tunnel";
/// Names the cluster the agent is dialing for, so credentials are checked
/// against exactly one entry.
pub const CLUSTER_HEADER: &str = "x-fleet-cluster";

/// The mTLS listener agents dial. Each accepted connection runs a tiny
/// HTTP/1.1 exchange (credential check + upgrade) and then becomes the
/// cluster's HTTP/2 tunnel with the roles reversed: this side is the h2
/// client, the agent the h2 server.
pub struct TunnelListener {
	provider: Arc<TunnelProvider>,
	listener: TcpListener,
	acceptor: TlsAcceptor,
}

impl TunnelListener {
	pub async fn bind(provider: Arc<TunnelProvider>, addr: SocketAddr) -> Result<Self, Error> {
		let (cert_pem, key_pem) = provider
			.ca()
			.generate_server_cert(&provider.options().server_cert_hosts)?;
		let config = tunnel_server_config(&cert_pem, &key_pem, provider.ca_cert_pem())?;
		let listener = TcpListener::bind(addr)
			.await
			.map_err(|e| Error::internal(format!("bind tunnel listener {addr}: {e}")))?;
		Ok(TunnelListener {
			provider,
			listener,
			acceptor: TlsAcceptor::from(Arc::new(config)),
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self
			.listener
			.local_addr()
			.expect("bound listener has an address")
	}

	pub async fn run(self, shutdown: CancellationToken) {
		info!("tunnel listener on {}", self.local_addr());
		loop {
			tokio::select! {
				_ = shutdown.cancelled() => return,
				accepted = self.listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(a) => a,
						Err(e) => {
							warn!("tunnel accept failed: {e}");
							continue;
						},
					};
					let provider = self.provider.clone();
					let acceptor = self.acceptor.clone();
					tokio::spawn(async move {
						if let Err(e) = handle_connection(provider, acceptor, stream).await {
							debug!(%peer, "tunnel connection ended: {e:#}");
						}
					});
				},
			}
		}
	}
}

async fn handle_connection(
	provider: Arc<TunnelProvider>,
	acceptor: TlsAcceptor,
	stream: TcpStream,
) -> anyhow::Result<()> {
	let tls = acceptor.accept(stream).await?;
	let io = TokioIo::new(tls);
	let svc = service_fn(move |req| handle_request(provider.clone(), req));
	hyper::server::conn::http1::Builder::new()
		.serve_connection(io, svc)
		.with_upgrades()
		.await?;
	Ok(())
}

async fn handle_request(
	provider: Arc<TunnelProvider>,
	mut req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
	if req.uri().path() != TUNNEL_PATH {
		return Ok(plain_response(StatusCode::NOT_FOUND, "not found"));
	}
	let cluster = req
		.headers()
		.get(CLUSTER_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);
	let credentials = basic_auth(&req);
	let (Some(cluster), Some((user, password))) = (cluster, credentials) else {
		return Ok(plain_response(StatusCode::UNAUTHORIZED, "unauthorized"));
	};
	if !provider.authorize_tunnel(&cluster, &user, &password) {
		// One opaque refusal for unknown cluster and bad credentials alike.
		return Ok(plain_response(StatusCode::UNAUTHORIZED, "unauthorized"));
	}

	let on_upgrade = hyper::upgrade::on(&mut req);
	tokio::spawn(async move {
		match on_upgrade.await {
			Ok(upgraded) => run_tunnel(provider, cluster, upgraded).await,
			Err(e) => warn!(%cluster, "tunnel upgrade failed: {e}"),
		}
	});

	let response = Response::builder()
		.status(StatusCode::SWITCHING_PROTOCOLS)
		.header(header::CONNECTION, "upgrade")
		.header(header::UPGRADE, TUNNEL_PROTOCOL)
		.body(Full::new(Bytes::new()))
		.expect("static response");
	Ok(response)
}

async fn run_tunnel(
	provider: Arc<TunnelProvider>,
	cluster: String,
	upgraded: hyper::upgrade::Upgraded,
) {
	let io = TokioIo::new(upgraded);
	let (send, connection) = match h2::client::handshake(io).await {
		Ok(pair) => pair,
		Err(e) => {
			warn!(%cluster, "tunnel h2 handshake failed: {e}");
			return;
		},
	};
	let Some((shutdown, generation)) = provider.install_tunnel(&cluster, send) else {
		debug!(%cluster, "cluster evicted before tunnel came up");
		return;
	};
	info!(%cluster, "tunnel connected");
	tokio::select! {
		res = connection => {
			if let Err(e) = res {
				debug!(%cluster, "tunnel connection error: {e}");
			}
		},
		_ = shutdown.cancelled() => {
			debug!(%cluster, "tunnel superseded by a newer registration");
		},
	}
	provider.clear_tunnel(&cluster, generation);
}

fn basic_auth(req: &Request<Incoming>) -> Option<(String, String)> {
	let header = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
	let encoded = header.strip_prefix("Basic ")?;
	let decoded = STANDARD.decode(encoded.as_bytes()).ok()?;
	let decoded = String::from_utf8(decoded).ok()?;
	let (user, password) = decoded.split_once(':')?;
	Some((user.to_string(), password.to_string()))
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Full::new(Bytes::from_static(body.as_bytes())))
		.expect("static response")
}
