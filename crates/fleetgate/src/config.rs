use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use fleet_core::serdes::serde_dur;

/// Server-mode configuration, loaded from a single YAML document. Unknown
/// keys are rejected so typos fail loudly at startup.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Config {
	pub server: ServerConfig,
	pub tunnel: TunnelConfig,
	pub ca: CaConfig,
	pub oidc: Option<OidcConfig>,
	pub manifest: Option<ManifestConfig>,
	pub bootstrap: BootstrapConfig,
	pub session: SessionConfig,
	pub cache: CacheConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			server: ServerConfig::default(),
			tunnel: TunnelConfig::default(),
			ca: CaConfig::default(),
			oidc: None,
			manifest: None,
			bootstrap: BootstrapConfig::default(),
			session: SessionConfig::default(),
			cache: CacheConfig::default(),
		}
	}
}

impl Config {
	pub fn from_yaml(contents: &str) -> anyhow::Result<Config> {
		Ok(serde_yaml::from_str(contents)?)
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ServerConfig {
	/// Listen address for the public RPC/HTTP listener. A bare `:port`
	/// binds all interfaces.
	pub address: String,
	/// CORS allow-list. Empty means allow any origin.
	pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig {
			address: ":8299".to_string(),
			allowed_origins: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct TunnelConfig {
	/// Listen address for the reverse-tunnel (mTLS) listener.
	pub address: String,
}

impl Default for TunnelConfig {
	fn default() -> Self {
		TunnelConfig {
			address: ":8300".to_string(),
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CaConfig {
	/// Directory holding `ca.pem` and `ca-key.pem`; created and populated
	/// on first start.
	pub dir: PathBuf,
}

impl Default for CaConfig {
	fn default() -> Self {
		CaConfig {
			dir: PathBuf::from("./fleet-ca"),
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OidcConfig {
	pub issuer: String,
	#[serde(rename = "clientID")]
	pub client_id: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestConfig {
	/// Externally reachable base URL of this server, embedded in agent
	/// manifests and manifest-download URLs.
	#[serde(rename = "serverURL")]
	pub server_url: String,
	/// Externally reachable address of the tunnel listener.
	#[serde(rename = "tunnelURL")]
	pub tunnel_url: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BootstrapConfig {
	pub enabled: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SessionConfig {
	#[serde(with = "serde_dur")]
	pub reap_interval: Duration,
}

impl Default for SessionConfig {
	fn default() -> Self {
		SessionConfig {
			reap_interval: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CacheConfig {
	#[serde(with = "serde_dur")]
	pub ttl: Duration,
}

impl Default for CacheConfig {
	fn default() -> Self {
		CacheConfig {
			ttl: Duration::from_secs(600),
		}
	}
}

/// Parses a listen address, accepting the `:port` shorthand for
/// all-interfaces binds.
pub fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
	if let Some(port) = addr.strip_prefix(':') {
		let port: u16 = port.parse()?;
		return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
	}
	Ok(addr.parse()?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_documented_values() {
		let cfg = Config::from_yaml("{}").unwrap();
		assert_eq!(cfg.server.address, ":8299");
		assert!(cfg.server.allowed_origins.is_empty());
		assert_eq!(cfg.session.reap_interval, Duration::from_secs(30));
		assert_eq!(cfg.cache.ttl, Duration::from_secs(600));
		assert!(!cfg.bootstrap.enabled);
		assert!(cfg.oidc.is_none());
	}

	#[test]
	fn documented_keys_parse() {
		let cfg = Config::from_yaml(
			r#"
server:
  address: ":9000"
  allowedOrigins: ["https://console.example.com"]
tunnel:
  address: ":9001"
ca:
  dir: /var/lib/fleet/ca
oidc:
  issuer: https://issuer.example.com
  clientID: fleet
manifest:
  serverURL: https://fleet.example.com
  tunnelURL: https://tunnel.example.com:9001
bootstrap:
  enabled: true
session:
  reapInterval: 10s
cache:
  ttl: 5m
"#,
		)
		.unwrap();
		assert_eq!(cfg.server.address, ":9000");
		assert_eq!(cfg.oidc.as_ref().unwrap().client_id, "fleet");
		assert_eq!(
			cfg.manifest.as_ref().unwrap().tunnel_url,
			"https://tunnel.example.com:9001"
		);
		assert_eq!(cfg.session.reap_interval, Duration::from_secs(10));
		assert_eq!(cfg.cache.ttl, Duration::from_secs(300));
	}

	#[test]
	fn unknown_keys_rejected() {
		assert!(Config::from_yaml("serverr: {}").is_err());
		assert!(Config::from_yaml("server: {adress: \":1\"}").is_err());
	}

	#[test]
	fn listen_addr_shorthand() {
		assert_eq!(
			parse_listen_addr(":8299").unwrap(),
			"0.0.0.0:8299".parse::<SocketAddr>().unwrap()
		);
		assert_eq!(
			parse_listen_addr("127.0.0.1:1234").unwrap(),
			"127.0.0.1:1234".parse::<SocketAddr>().unwrap()
		);
		assert!(parse_listen_addr("nope").is_err());
	}
}
