//! Request/response messages for the RPC surface. Binary payloads (stdin,
//! forwarded bytes, terminal output) travel base64-encoded so every frame
//! stays valid JSON.

use fleet_core::Strng;

use crate::backend::{ListOptions, ResourceInfo};

/// Serde helper for base64url payload fields.
pub mod b64 {
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		STANDARD
			.decode(s.as_bytes())
			.map_err(serde::de::Error::custom)
	}
}

pub mod b64_option {
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(
		bytes: &Option<Vec<u8>>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match bytes {
			Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = Option::<String>::deserialize(deserializer)?;
		s.map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
			.transpose()
	}
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Empty {}

// --- Fleet ---

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ListClustersRequest {}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
	pub name: Strng,
	pub endpoint: String,
	pub agent_version: String,
	pub connected: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ListClustersResponse {
	pub clusters: Vec<ClusterSummary>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
	pub cluster: String,
	pub agent_id: String,
	#[serde(default)]
	pub agent_version: String,
	pub csr_pem: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
	pub endpoint: String,
	pub cert_pem: String,
	pub ca_cert_pem: String,
	pub server_version: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GetAgentManifestRequest {
	pub cluster: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GetAgentManifestResponse {
	pub url: String,
}

// --- Resource ---

/// Target coordinates shared by every resource operation.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
	pub cluster: String,
	#[serde(default)]
	pub group: String,
	pub version: String,
	pub resource: String,
	#[serde(default)]
	pub namespace: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DiscoveryRequest {
	pub cluster: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DiscoveryResponse {
	pub resources: Vec<ResourceInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRequest {
	pub cluster: String,
	#[serde(default)]
	pub group: String,
	pub version: String,
	pub kind: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchemaResponse {
	pub schema: serde_json::Value,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
	#[serde(flatten)]
	pub target: ResourceRef,
	#[serde(flatten)]
	pub options: ListOptions,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRequest {
	#[serde(flatten)]
	pub target: ResourceRef,
	pub name: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ObjectResponse {
	pub object: serde_json::Value,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DescribeResponse {
	pub object: serde_json::Value,
	pub events: serde_json::Value,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
	#[serde(flatten)]
	pub target: ResourceRef,
	pub object: serde_json::Value,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
	#[serde(flatten)]
	pub target: ResourceRef,
	pub yaml: String,
	#[serde(default)]
	pub force: bool,
	#[serde(default)]
	pub field_manager: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
	#[serde(flatten)]
	pub target: ResourceRef,
	pub name: String,
	#[serde(default)]
	pub grace_period_seconds: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRequest {
	#[serde(flatten)]
	pub target: ResourceRef,
	#[serde(default)]
	pub label_selector: Option<String>,
	#[serde(default)]
	pub field_selector: Option<String>,
	#[serde(default)]
	pub resource_version: Option<String>,
}

// --- Runtime ---

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodLogRequest {
	pub cluster: String,
	pub namespace: String,
	pub name: String,
	#[serde(default)]
	pub container: Option<String>,
	#[serde(default)]
	pub follow: bool,
	#[serde(default)]
	pub tail_lines: Option<i64>,
	#[serde(default)]
	pub since_seconds: Option<i64>,
	#[serde(default)]
	pub previous: bool,
	#[serde(default)]
	pub timestamps: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunk {
	#[serde(with = "b64")]
	pub data: Vec<u8>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTtyRequest {
	pub cluster: String,
	pub namespace: String,
	pub name: String,
	#[serde(default)]
	pub container: Option<String>,
	pub command: Vec<String>,
	#[serde(default)]
	pub tty: bool,
	#[serde(default)]
	pub rows: u16,
	#[serde(default)]
	pub cols: u16,
}

/// Stream message for exec. The first frame carries only the session id;
/// later frames carry output bytes.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	#[serde(default, with = "b64_option", skip_serializing_if = "Option::is_none")]
	pub stdout: Option<Vec<u8>>,
	#[serde(default, with = "b64_option", skip_serializing_if = "Option::is_none")]
	pub stderr: Option<Vec<u8>>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTtyRequest {
	pub cluster: String,
	pub session_id: String,
	#[serde(with = "b64")]
	pub stdin: Vec<u8>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeTtyRequest {
	pub cluster: String,
	pub session_id: String,
	pub rows: u16,
	pub cols: u16,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardRequest {
	pub cluster: String,
	pub namespace: String,
	pub name: String,
	pub port: u16,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardMessage {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	#[serde(default, with = "b64_option", skip_serializing_if = "Option::is_none")]
	pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WritePortForwardRequest {
	pub cluster: String,
	pub session_id: String,
	#[serde(with = "b64")]
	pub data: Vec<u8>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleRequest {
	#[serde(flatten)]
	pub target: ResourceRef,
	pub name: String,
	pub replicas: i32,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRequest {
	#[serde(flatten)]
	pub target: ResourceRef,
	pub name: String,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn binary_fields_roundtrip_base64() {
		let req = WriteTtyRequest {
			cluster: "dev".into(),
			session_id: "abc".into(),
			stdin: vec![0, 159, 146, 150],
		};
		let json = serde_json::to_string(&req).unwrap();
		let back: WriteTtyRequest = serde_json::from_str(&json).unwrap();
		assert_eq!(back.stdin, req.stdin);
		// The wire form is a string, not a byte array.
		assert!(json.contains("\"stdin\":\""));
	}

	#[test]
	fn resource_ref_flattens() {
		let req = GetRequest {
			target: ResourceRef {
				cluster: "dev".into(),
				group: "apps".into(),
				version: "v1".into(),
				resource: "deployments".into(),
				namespace: Some("default".into()),
			},
			name: "web".into(),
		};
		let json = serde_json::to_value(&req).unwrap();
		assert_eq!(json["cluster"], "dev");
		assert_eq!(json["resource"], "deployments");
		assert_eq!(json["name"], "web");
	}

	#[test]
	fn exec_output_first_frame_shape() {
		let first = ExecOutput {
			session_id: Some("id-1".into()),
			..Default::default()
		};
		assert_eq!(
			serde_json::to_string(&first).unwrap(),
			r#"{"sessionId":"id-1"}"#
		);
	}
}
