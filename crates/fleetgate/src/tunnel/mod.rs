mod acceptor;
mod agent;
mod h2stream;
mod provider;
mod tls;

pub use acceptor::{CLUSTER_HEADER, TUNNEL_PATH, TUNNEL_PROTOCOL, TunnelListener};
pub use agent::{AgentTunnel, AgentTunnelConfig};
pub use h2stream::H2Stream;
pub use provider::{Cluster, DEFAULT_WAIT_FOR, TunnelOptions, TunnelProvider};
pub use tls::{install_default_provider, provider as tls_provider, tunnel_client_config, tunnel_server_config};
