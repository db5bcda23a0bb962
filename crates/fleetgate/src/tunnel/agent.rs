use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::{Method, Request, StatusCode, header};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Error;
use crate::pki::derive_auth;
use crate::tunnel::acceptor::{CLUSTER_HEADER, TUNNEL_PATH, TUNNEL_PROTOCOL};
use crate::tunnel::h2stream::H2Stream;
use crate::tunnel::tls::tunnel_client_config;

/// Reconnect backoff bounds for the agent's dial loop.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(120);
/// A tunnel that stayed up this long resets the backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AgentTunnelConfig {
	pub cluster: String,
	pub agent_id: String,
	/// `host:port` of the server's tunnel listener.
	pub tunnel_addr: String,
	/// TLS server name; defaults to the host part of `tunnel_addr`.
	pub server_name: String,
	pub ca_cert_pem: String,
	pub cert_pem: String,
	pub key_pem: String,
	/// The agent's loopback RPC listener that tunneled connections reach.
	pub local_addr: SocketAddr,
}

/// The agent half of the reverse tunnel: dials out with mTLS, upgrades, and
/// then serves HTTP/2 CONNECT streams by splicing each one onto the local
/// RPC listener.
pub struct AgentTunnel {
	cfg: AgentTunnelConfig,
	tls: TlsConnector,
	auth_header: String,
}

impl AgentTunnel {
	pub fn new(cfg: AgentTunnelConfig) -> Result<Arc<Self>, Error> {
		let tls_config = tunnel_client_config(&cfg.ca_cert_pem, &cfg.cert_pem, &cfg.key_pem)?;
		// Both ends derive the same secret from the signed cert; no
		// password ever crosses the wire at registration time.
		let auth = derive_auth(&cfg.agent_id, &cfg.cert_pem)?;
		let auth_header = format!("Basic {}", STANDARD.encode(auth.as_bytes()));
		Ok(Arc::new(AgentTunnel {
			cfg,
			tls: TlsConnector::from(Arc::new(tls_config)),
			auth_header,
		}))
	}

	/// Dial loop with exponential backoff; returns only on shutdown.
	pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
		let mut backoff = INITIAL_BACKOFF;
		loop {
			let started = Instant::now();
			tokio::select! {
				_ = shutdown.cancelled() => return,
				res = self.run_once() => match res {
					Ok(()) => info!("tunnel closed, reconnecting"),
					Err(e) => warn!("tunnel attempt failed: {e:#}"),
				},
			}
			if started.elapsed() > STABLE_CONNECTION {
				backoff = INITIAL_BACKOFF;
			}
			tokio::select! {
				_ = shutdown.cancelled() => return,
				_ = tokio::time::sleep(backoff) => {},
			}
			backoff = (backoff * 2).min(MAX_BACKOFF);
		}
	}

	/// One tunnel lifetime: TCP → mTLS → HTTP/1.1 upgrade → serve h2.
	pub async fn run_once(&self) -> anyhow::Result<()> {
		let tcp = TcpStream::connect(&self.cfg.tunnel_addr).await?;
		let server_name = ServerName::try_from(self.cfg.server_name.clone())?;
		let tls = self.tls.connect(server_name, tcp).await?;

		let (mut sender, conn) =
			hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(tls)).await?;
		let conn_task = tokio::spawn(conn.with_upgrades());

		let request = Request::builder()
			.method(Method::GET)
			.uri(TUNNEL_PATH)
			.header(header::HOST, self.cfg.server_name.as_str())
			.header(header::CONNECTION, "upgrade")
			.header(header::UPGRADE, TUNNEL_PROTOCOL)
			.header(header::AUTHORIZATION, self.auth_header.as_str())
			.header(CLUSTER_HEADER, self.cfg.cluster.as_str())
			.body(Empty::new())?;
		let response = sender.send_request(request).await?;
		if response.status() != StatusCode::SWITCHING_PROTOCOLS {
			conn_task.abort();
			anyhow::bail!("tunnel upgrade refused: {}", response.status());
		}
		let upgraded = hyper::upgrade::on(response).await?;

		let mut h2 = h2::server::handshake(TokioIo::new(upgraded)).await?;
		info!(cluster = %self.cfg.cluster, "tunnel established");

		while let Some(accepted) = h2.accept().await {
			let (request, mut respond) = accepted?;
			if request.method() != Method::CONNECT {
				let refuse = http::Response::builder()
					.status(StatusCode::NOT_FOUND)
					.body(())
					.expect("static response");
				let _ = respond.send_response(refuse, true);
				continue;
			}
			let local = self.cfg.local_addr;
			tokio::spawn(async move {
				let recv = request.into_body();
				let tcp = match TcpStream::connect(local).await {
					Ok(tcp) => tcp,
					Err(e) => {
						debug!("local RPC listener unreachable: {e}");
						let refuse = http::Response::builder()
							.status(StatusCode::BAD_GATEWAY)
							.body(())
							.expect("static response");
						let _ = respond.send_response(refuse, true);
						return;
					},
				};
				let ok = http::Response::new(());
				let send = match respond.send_response(ok, false) {
					Ok(send) => send,
					Err(e) => {
						debug!("tunnel stream refused mid-open: {e}");
						return;
					},
				};
				let mut tcp = tcp;
				let mut stream = H2Stream::new(recv, send);
				let _ = tokio::io::copy_bidirectional(&mut tcp, &mut stream).await;
			});
		}
		conn_task.abort();
		Ok(())
	}
}
