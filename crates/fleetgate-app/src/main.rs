use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use fleet_core::{signal, strng, telemetry, version::BuildInfo};
use fleetgate::authn::OidcVerifier;
use fleetgate::backend::{KubeBackend, KubeClientBackend};
use fleetgate::bootstrap::Bootstrapper;
use fleetgate::config::{Config, parse_listen_addr};
use fleetgate::discovery::DiscoveryCache;
use fleetgate::fleet::FleetUseCase;
use fleetgate::handlers::local::AgentState;
use fleetgate::pki::{MANIFEST_TOKEN_LABEL, provide_ca};
use fleetgate::proxy::{AlwaysLeader, RpcProxy};
use fleetgate::resource::{BackendSchemaFetcher, ResourceUseCase};
use fleetgate::rpc::types::{RegisterRequest, RegisterResponse};
use fleetgate::rpc::{RpcClient, paths, tls_transport};
use fleetgate::runtime::RuntimeUseCase;
use fleetgate::runtime::session::{SessionStore, run_reaper};
use fleetgate::serve::{ServerParts, agent_router, serve, server_router};
use fleetgate::telemetry::Metrics;
use fleetgate::tunnel::{
	AgentTunnel, AgentTunnelConfig, TunnelListener, TunnelOptions, TunnelProvider,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "fleetgate", version, about = "Multi-cluster Kubernetes control-plane gateway")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run the central control server.
	Server(ServerArgs),
	/// Run the per-cluster agent.
	Agent(AgentArgs),
}

#[derive(Args)]
struct ServerArgs {
	/// Path to the YAML configuration file.
	#[arg(long)]
	config: Option<PathBuf>,
}

#[derive(Args)]
struct AgentArgs {
	/// Logical name of the cluster this agent manages.
	#[arg(long, env = "FLEET_CLUSTER")]
	cluster: String,
	/// Base URL of the control server's RPC listener.
	#[arg(long, env = "FLEET_SERVER_URL")]
	server_url: String,
	/// `host:port` of the control server's tunnel listener.
	#[arg(long, env = "FLEET_TUNNEL_URL")]
	tunnel_url: String,
	/// Stable identity of this agent instance; defaults to the hostname.
	#[arg(long, env = "FLEET_AGENT_ID")]
	agent_id: Option<String>,
	/// Apply the embedded bootstrap manifests before serving.
	#[arg(long, default_value_t = false)]
	bootstrap: bool,
}

/// Distinguishes pre-serve failures (exit 1) from failures after the
/// listeners were up (exit 2).
enum AppError {
	Startup(anyhow::Error),
	Runtime(anyhow::Error),
}

fn startup(e: impl Into<anyhow::Error>) -> AppError {
	AppError::Startup(e.into())
}

fn main() -> ExitCode {
	telemetry::setup_logging();
	fleetgate::tunnel::install_default_provider();
	let cli = Cli::parse();

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(rt) => rt,
		Err(e) => {
			error!("failed to start runtime: {e}");
			return ExitCode::from(1);
		},
	};
	let result = runtime.block_on(async {
		match cli.command {
			Command::Server(args) => run_server(args).await,
			Command::Agent(args) => run_agent(args).await,
		}
	});
	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(AppError::Startup(e)) => {
			error!("startup failed: {e:#}");
			ExitCode::from(1)
		},
		Err(AppError::Runtime(e)) => {
			error!("fatal runtime error: {e:#}");
			ExitCode::from(2)
		},
	}
}

async fn run_server(args: ServerArgs) -> Result<(), AppError> {
	let config = match &args.config {
		Some(path) => {
			let contents = fs_err::read_to_string(path).map_err(startup)?;
			Config::from_yaml(&contents).map_err(startup)?
		},
		None => Config::default(),
	};
	info!("fleetgate server {} starting", BuildInfo::new());

	let manifest = config
		.manifest
		.clone()
		.ok_or_else(|| startup(anyhow::anyhow!("manifest.serverURL and manifest.tunnelURL must be configured")))?;
	let oidc = config
		.oidc
		.clone()
		.ok_or_else(|| startup(anyhow::anyhow!("oidc.issuer and oidc.clientID must be configured")))?;

	let ca = Arc::new(provide_ca(&config.ca.dir).map_err(startup)?);
	let hmac_key = ca.derive_hmac_key(MANIFEST_TOKEN_LABEL).map_err(startup)?;

	let metrics = Arc::new(Metrics::new());
	let mut tunnel_opts = TunnelOptions::default();
	if let Some(host) = host_of(&manifest.tunnel_url) {
		if !tunnel_opts.server_cert_hosts.contains(&host) {
			tunnel_opts.server_cert_hosts.push(host);
		}
	}
	let provider = TunnelProvider::new(ca, tunnel_opts, metrics.clone());
	let fleet = Arc::new(
		FleetUseCase::new(provider.clone(), &hmac_key, &manifest, None).map_err(startup)?,
	);
	let proxy = Arc::new(RpcProxy::new(
		provider.clone(),
		Arc::new(AlwaysLeader),
		metrics.clone(),
	));
	let verifier = Arc::new(
		OidcVerifier::discover(&oidc.issuer, &oidc.client_id)
			.await
			.map_err(startup)?,
	);

	let router = server_router(ServerParts {
		fleet,
		proxy,
		verifier,
		metrics,
		allowed_origins: config.server.allowed_origins.clone(),
	})
	.map_err(startup)?;

	let rpc_addr = parse_listen_addr(&config.server.address).map_err(startup)?;
	let tunnel_addr = parse_listen_addr(&config.tunnel.address).map_err(startup)?;
	let rpc_listener = tokio::net::TcpListener::bind(rpc_addr).await.map_err(startup)?;
	let tunnel_listener = TunnelListener::bind(provider, tunnel_addr)
		.await
		.map_err(startup)?;
	info!("serving RPCs on {rpc_addr}, tunnels on {tunnel_addr}");

	let shutdown = CancellationToken::new();
	let tunnel_task = tokio::spawn(tunnel_listener.run(shutdown.clone()));
	let server_task = tokio::spawn(serve(rpc_listener, router, shutdown.clone()));

	signal::Shutdown::new().wait().await;
	info!("shutting down");
	shutdown.cancel();
	let _ = tunnel_task.await;
	match server_task.await {
		Ok(Ok(())) => Ok(()),
		Ok(Err(e)) => Err(AppError::Runtime(e.into())),
		Err(e) => Err(AppError::Runtime(e.into())),
	}
}

async fn run_agent(args: AgentArgs) -> Result<(), AppError> {
	info!(
		"fleetgate agent {} starting for cluster {}",
		BuildInfo::new(),
		args.cluster
	);
	let agent_id = args
		.agent_id
		.clone()
		.or_else(|| std::env::var("HOSTNAME").ok())
		.filter(|s| !s.is_empty())
		.unwrap_or_else(|| "agent".to_string());

	let backend: Arc<dyn KubeBackend> =
		Arc::new(KubeClientBackend::infer().await.map_err(startup)?);

	if args.bootstrap {
		Bootstrapper::new(backend.clone())
			.run()
			.await
			.map_err(startup)?;
	}

	let metrics = Arc::new(Metrics::new());
	let config = Config::default();
	let cache = DiscoveryCache::new(
		BackendSchemaFetcher::new(backend.clone()),
		config.cache.ttl,
	);
	let resource = Arc::new(ResourceUseCase::new(
		backend.clone(),
		cache.clone(),
		strng::new(&args.cluster),
	));
	let store = Arc::new(SessionStore::new(metrics.clone()));
	let runtime = Arc::new(RuntimeUseCase::new(backend.clone(), store.clone()));

	// Loopback RPC listener; only reachable through the tunnel.
	let local_listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
		.await
		.map_err(startup)?;
	let local_addr = local_listener.local_addr().map_err(startup)?;
	let router = agent_router(AgentState { resource, runtime });

	// Register with the control server; keep trying, the server may still
	// be coming up.
	let transport = tls_transport().map_err(startup)?;
	let client = RpcClient::new(transport, args.server_url.trim_end_matches('/'));
	let csr = fleetgate::pki::CsrOptions {
		common_name: agent_id.clone(),
	}
	.generate()
	.map_err(startup)?;
	let registration = register_with_retry(&client, &args, &agent_id, &csr.csr_pem).await;
	info!(
		endpoint = %registration.endpoint,
		server_version = %registration.server_version,
		"registered with control server"
	);

	let tunnel_addr = args
		.tunnel_url
		.split_once("://")
		.map(|(_, rest)| rest.to_string())
		.unwrap_or_else(|| args.tunnel_url.clone());
	let server_name = host_of(&args.tunnel_url)
		.ok_or_else(|| startup(anyhow::anyhow!("cannot determine tunnel host from {}", args.tunnel_url)))?;
	let tunnel = AgentTunnel::new(AgentTunnelConfig {
		cluster: args.cluster.clone(),
		agent_id,
		tunnel_addr,
		server_name,
		ca_cert_pem: registration.ca_cert_pem,
		cert_pem: registration.cert_pem,
		key_pem: csr.key_pem,
		local_addr,
	})
	.map_err(startup)?;

	let shutdown = CancellationToken::new();
	tokio::spawn(run_reaper(
		store,
		config.session.reap_interval,
		shutdown.clone(),
	));
	tokio::spawn(cache.clone().run_evictor(config.cache.ttl, shutdown.clone()));
	tokio::spawn(tunnel.run(shutdown.clone()));
	let server_task = tokio::spawn(serve(local_listener, router, shutdown.clone()));

	signal::Shutdown::new().wait().await;
	info!("shutting down");
	shutdown.cancel();
	match server_task.await {
		Ok(Ok(())) => Ok(()),
		Ok(Err(e)) => Err(AppError::Runtime(e.into())),
		Err(e) => Err(AppError::Runtime(e.into())),
	}
}

async fn register_with_retry(
	client: &RpcClient<fleetgate::rpc::TlsConnector>,
	args: &AgentArgs,
	agent_id: &str,
	csr_pem: &str,
) -> RegisterResponse {
	let request = RegisterRequest {
		cluster: args.cluster.clone(),
		agent_id: agent_id.to_string(),
		agent_version: BuildInfo::new().version.to_string(),
		csr_pem: csr_pem.to_string(),
	};
	let mut backoff = Duration::from_secs(1);
	loop {
		match client
			.unary::<_, RegisterResponse>(paths::FLEET_REGISTER, &request, None)
			.await
		{
			Ok(response) => return response,
			Err(e) => {
				warn!("registration failed: {e}; retrying in {backoff:?}");
				tokio::time::sleep(backoff).await;
				backoff = (backoff * 2).min(Duration::from_secs(60));
			},
		}
	}
}

/// Host portion of a `host:port` or URL-shaped address.
fn host_of(addr: &str) -> Option<String> {
	if addr.contains("://") {
		return url::Url::parse(addr)
			.ok()
			.and_then(|u| u.host_str().map(str::to_string));
	}
	let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
	if host.is_empty() {
		None
	} else {
		Some(host.to_string())
	}
}
