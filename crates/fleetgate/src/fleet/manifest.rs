use std::collections::HashMap;

use tera::{Context, Tera, Value};

use crate::errors::Error;

/// Default agent image when the operator does not override it.
pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/fleetgate/fleetgate-agent:latest";

/// The multi-document YAML applied to a managed cluster to install the
/// agent. User-controlled values pass through the `yaml_quote` filter;
/// everything else is restricted to sanitized identifiers.
const AGENT_MANIFEST_TEMPLATE: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: fleetgate-system
  labels:
    app.kubernetes.io/managed-by: fleetgate
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: fleetgate-agent
  namespace: fleetgate-system
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: fleetgate-agent-{{ sanitized_user }}
  annotations:
    fleetgate.io/installed-by: {{ user_name | yaml_quote }}
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: cluster-admin
subjects:
  - kind: ServiceAccount
    name: fleetgate-agent
    namespace: fleetgate-system
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: fleetgate-agent
  namespace: fleetgate-system
  labels:
    app.kubernetes.io/name: fleetgate-agent
  annotations:
    fleetgate.io/cluster: {{ cluster }}
    fleetgate.io/installed-by: {{ user_name | yaml_quote }}
spec:
  replicas: 1
  selector:
    matchLabels:
      app.kubernetes.io/name: fleetgate-agent
  template:
    metadata:
      labels:
        app.kubernetes.io/name: fleetgate-agent
    spec:
      serviceAccountName: fleetgate-agent
      containers:
        - name: agent
          image: {{ image }}
          args:
            - agent
          env:
            - name: FLEET_CLUSTER
              value: {{ cluster }}
            - name: FLEET_SERVER_URL
              value: {{ server_url | yaml_quote }}
            - name: FLEET_TUNNEL_URL
              value: {{ tunnel_url | yaml_quote }}
          resources:
            requests:
              cpu: 50m
              memory: 64Mi
"#;

/// JSON-encodes the value so it is always a safe YAML double-quoted scalar,
/// whatever characters the user name contains.
fn yaml_quote(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
	let s = match value {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	};
	let quoted = serde_json::to_string(&s).map_err(|e| tera::Error::msg(e.to_string()))?;
	Ok(Value::String(quoted))
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ManifestInputs {
	pub cluster: String,
	pub user_name: String,
	pub sanitized_user: String,
	pub image: String,
	pub server_url: String,
	pub tunnel_url: String,
}

pub struct ManifestRenderer {
	tera: Tera,
}

impl std::fmt::Debug for ManifestRenderer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ManifestRenderer").finish_non_exhaustive()
	}
}

impl ManifestRenderer {
	pub fn new() -> Result<Self, Error> {
		let mut tera = Tera::default();
		tera
			.add_raw_template("agent.yaml", AGENT_MANIFEST_TEMPLATE)
			.map_err(|e| Error::internal(format!("agent manifest template: {e}")))?;
		tera.register_filter("yaml_quote", yaml_quote);
		Ok(ManifestRenderer { tera })
	}

	pub fn render(&self, inputs: &ManifestInputs) -> Result<String, Error> {
		let ctx = Context::from_serialize(inputs)
			.map_err(|e| Error::internal(format!("manifest context: {e}")))?;
		self
			.tera
			.render("agent.yaml", &ctx)
			.map_err(|e| Error::internal(format!("render manifest: {e}")))
	}
}

/// Folds an arbitrary user identifier into a valid Kubernetes object-name
/// segment: lowercase, runs of non-alphanumerics collapsed to a single `-`,
/// hyphens trimmed from both ends, at most 63 characters. An input with no
/// usable characters falls back to a digest-derived name.
pub fn sanitize_k8s_name(input: &str) -> String {
	let mut out = String::with_capacity(input.len());
	let mut pending_dash = false;
	for c in input.to_lowercase().chars() {
		if c.is_ascii_alphanumeric() {
			if pending_dash && !out.is_empty() {
				out.push('-');
			}
			out.push(c);
			pending_dash = false;
		} else {
			pending_dash = true;
		}
	}
	out.truncate(63);
	while out.ends_with('-') {
		out.pop();
	}
	if out.is_empty() {
		let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, input.as_bytes());
		return format!("u-{}", hex::encode(&digest.as_ref()[..8]));
	}
	out
}

#[cfg(test)]
mod tests {
	use serde::Deserialize;

	use super::*;

	fn inputs() -> ManifestInputs {
		ManifestInputs {
			cluster: "dev".into(),
			user_name: "Alice O'Malley <alice@example.com>".into(),
			sanitized_user: sanitize_k8s_name("Alice O'Malley <alice@example.com>"),
			image: DEFAULT_AGENT_IMAGE.into(),
			server_url: "https://fleet.example.com".into(),
			tunnel_url: "tunnel.example.com:8300".into(),
		}
	}

	#[test]
	fn rendered_manifest_is_valid_multi_doc_yaml() {
		let renderer = ManifestRenderer::new().unwrap();
		let yaml = renderer.render(&inputs()).unwrap();
		let docs: Vec<serde_yaml::Value> = serde_yaml::Deserializer::from_str(&yaml)
			.map(|doc| serde_yaml::Value::deserialize(doc).unwrap())
			.collect();
		assert_eq!(docs.len(), 4);
		assert_eq!(docs[0]["kind"], "Namespace");
		assert_eq!(docs[3]["kind"], "Deployment");
		// The quoted user name survives YAML parsing byte-for-byte.
		assert_eq!(
			docs[3]["metadata"]["annotations"]["fleetgate.io/installed-by"],
			"Alice O'Malley <alice@example.com>"
		);
	}

	#[test]
	fn yaml_quote_defuses_injection() {
		let renderer = ManifestRenderer::new().unwrap();
		let mut evil = inputs();
		evil.user_name = "x\"\nkind: Evil\nspec: \"y".into();
		let yaml = renderer.render(&evil).unwrap();
		let docs: Vec<serde_yaml::Value> = serde_yaml::Deserializer::from_str(&yaml)
			.map(|doc| serde_yaml::Value::deserialize(doc).unwrap())
			.collect();
		// Still exactly four documents; the payload stayed inside the scalar.
		assert_eq!(docs.len(), 4);
		assert_eq!(
			docs[2]["metadata"]["annotations"]["fleetgate.io/installed-by"],
			"x\"\nkind: Evil\nspec: \"y"
		);
	}

	#[test]
	fn sanitize_collapses_and_trims() {
		assert_eq!(sanitize_k8s_name("Alice Smith"), "alice-smith");
		assert_eq!(sanitize_k8s_name("alice@example.com"), "alice-example-com");
		assert_eq!(sanitize_k8s_name("--Bob--"), "bob");
		assert_eq!(sanitize_k8s_name("a__b..c"), "a-b-c");
	}

	#[test]
	fn sanitize_is_idempotent_and_bounded() {
		let long = "User!".repeat(40);
		for input in ["Alice Smith", "日本語ユーザー", "!!!", long.as_str()] {
			let once = sanitize_k8s_name(input);
			assert_eq!(sanitize_k8s_name(&once), once, "input {input:?}");
			assert!(once.len() <= 63);
			let re = regex::Regex::new("^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap();
			assert!(re.is_match(&once), "input {input:?} -> {once:?}");
		}
	}

	#[test]
	fn sanitize_empty_falls_back_to_digest() {
		let name = sanitize_k8s_name("!!!");
		assert!(name.starts_with("u-"));
		assert_eq!(name.len(), 2 + 16);
		assert_eq!(name, sanitize_k8s_name("!!!"));
		assert_ne!(name, sanitize_k8s_name("???"));
	}
}
