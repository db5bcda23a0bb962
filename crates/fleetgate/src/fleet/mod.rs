mod manifest;
mod token;

use std::sync::Arc;

use fleet_core::Strng;
use fleet_core::version::BuildInfo;
use once_cell::sync::Lazy;
use regex::Regex;

pub use manifest::{DEFAULT_AGENT_IMAGE, ManifestInputs, ManifestRenderer, sanitize_k8s_name};
pub use token::{CLOCK_SKEW, TOKEN_TTL, TokenSigner};

use crate::config::ManifestConfig;
use crate::errors::Error;
use crate::tunnel::{Cluster, TunnelProvider};

static CLUSTER_NAME_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new("^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("static regex"));

/// Validates a cluster name against the Kubernetes label-style grammar.
pub fn validate_cluster_name(name: &str) -> Result<(), Error> {
	if name.is_empty() || name.len() > 63 || !CLUSTER_NAME_RE.is_match(name) {
		return Err(Error::invalid_input(
			"cluster",
			"must match ^[a-z0-9]([a-z0-9-]*[a-z0-9])?$ and be 1-63 characters",
		));
	}
	Ok(())
}

/// The result of a successful agent registration. Ephemeral; the agent holds
/// it in memory only.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Registration {
	pub endpoint: String,
	pub cert_pem: String,
	pub ca_cert_pem: String,
	pub server_version: String,
}

/// Fleet membership: registration, manifest-token issue/verify, and agent
/// manifest rendering.
pub struct FleetUseCase {
	provider: Arc<TunnelProvider>,
	signer: TokenSigner,
	renderer: ManifestRenderer,
	server_url: String,
	tunnel_url: String,
	image: String,
}

impl std::fmt::Debug for FleetUseCase {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FleetUseCase")
			.field("server_url", &self.server_url)
			.finish_non_exhaustive()
	}
}

impl FleetUseCase {
	pub fn new(
		provider: Arc<TunnelProvider>,
		hmac_key: &[u8; 32],
		manifest: &ManifestConfig,
		image: Option<String>,
	) -> Result<Self, Error> {
		if manifest.server_url.trim().is_empty() {
			return Err(Error::invalid_input("serverURL", "must not be empty"));
		}
		if manifest.tunnel_url.trim().is_empty() {
			return Err(Error::invalid_input("tunnelURL", "must not be empty"));
		}
		url::Url::parse(&manifest.server_url)
			.map_err(|e| Error::invalid_input("serverURL", format!("not a valid URL: {e}")))?;
		Ok(FleetUseCase {
			provider,
			signer: TokenSigner::new(hmac_key),
			renderer: ManifestRenderer::new()?,
			server_url: manifest.server_url.trim_end_matches('/').to_string(),
			tunnel_url: manifest.tunnel_url.clone(),
			image: image.unwrap_or_else(|| DEFAULT_AGENT_IMAGE.to_string()),
		})
	}

	/// CSR-based registration: validates inputs, then delegates endpoint
	/// allocation and credential rotation to the tunnel provider.
	pub async fn register(
		&self,
		cluster: &str,
		agent_id: &str,
		agent_version: &str,
		csr_pem: &str,
	) -> Result<Registration, Error> {
		validate_cluster_name(cluster)?;
		if agent_id.trim().is_empty() {
			return Err(Error::invalid_input("agentId", "must not be empty"));
		}
		if csr_pem.trim().is_empty() {
			return Err(Error::invalid_input("csr", "must not be empty"));
		}
		let (endpoint, cert_pem) = self
			.provider
			.register_cluster(cluster, agent_id, agent_version, csr_pem)
			.await?;
		Ok(Registration {
			endpoint: endpoint.to_string(),
			cert_pem,
			ca_cert_pem: self.provider.ca_cert_pem().to_string(),
			server_version: BuildInfo::new().version.to_string(),
		})
	}

	pub fn list_clusters(&self) -> std::collections::HashMap<Strng, Cluster> {
		self.provider.list_clusters()
	}

	/// Issues a manifest token for `cluster` on behalf of `user` and wraps it
	/// in a download URL.
	pub fn issue_manifest_url(&self, cluster: &str, user: &str) -> Result<String, Error> {
		validate_cluster_name(cluster)?;
		if user.trim().is_empty() {
			return Err(Error::invalid_input("user", "must not be empty"));
		}
		let token = self.signer.issue(cluster, user);
		Ok(format!("{}/fleet/manifest/{}", self.server_url, token))
	}

	pub fn verify_token(&self, token: &str) -> Result<(Strng, Strng), Error> {
		self.signer.verify(token)
	}

	/// Verifies the token and renders the agent manifest it authorizes.
	pub fn manifest_for_token(&self, token: &str) -> Result<String, Error> {
		let (cluster, user) = self.signer.verify(token)?;
		self.render_manifest(&cluster, &user)
	}

	pub fn render_manifest(&self, cluster: &str, user: &str) -> Result<String, Error> {
		validate_cluster_name(cluster)?;
		self.renderer.render(&ManifestInputs {
			cluster: cluster.to_string(),
			user_name: user.to_string(),
			sanitized_user: sanitize_k8s_name(user),
			image: self.image.clone(),
			server_url: self.server_url.clone(),
			tunnel_url: self.tunnel_url.clone(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cluster_name_grammar() {
		for ok in ["a", "dev", "dev-1", "a1-b2-c3", &"x".repeat(63)] {
			assert!(validate_cluster_name(ok).is_ok(), "{ok}");
		}
		for bad in [
			"",
			"UPPER",
			"-leading",
			"trailing-",
			"под",
			"dot.name",
			&"x".repeat(64),
		] {
			let err = validate_cluster_name(bad).unwrap_err();
			assert!(
				err.to_string().contains("must match"),
				"{bad} -> {err}"
			);
		}
	}
}
