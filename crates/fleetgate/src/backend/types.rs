use fleet_core::Strng;

/// Group/version/resource, the URL-path vocabulary of the Kubernetes API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Gvr {
	pub group: Strng,
	pub version: Strng,
	pub resource: Strng,
}

impl Gvr {
	pub fn new(
		group: impl Into<Strng>,
		version: impl Into<Strng>,
		resource: impl Into<Strng>,
	) -> Self {
		Gvr {
			group: group.into(),
			version: version.into(),
			resource: resource.into(),
		}
	}
}

impl std::fmt::Display for Gvr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.group.is_empty() {
			write!(f, "{}/{}", self.version, self.resource)
		} else {
			write!(f, "{}/{}/{}", self.group, self.version, self.resource)
		}
	}
}

/// What discovery knows about one served resource.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
	pub group: Strng,
	pub version: Strng,
	pub resource: Strng,
	pub kind: Strng,
	pub namespaced: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListOptions {
	pub label_selector: Option<String>,
	pub field_selector: Option<String>,
	pub limit: Option<u32>,
	#[serde(rename = "continue")]
	pub continue_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
	pub label_selector: Option<String>,
	pub field_selector: Option<String>,
	pub resource_version: Option<String>,
	/// Ask the server to stream an initial snapshot before change events
	/// (the ≥ 1.34 watch-list feature).
	pub send_initial_events: bool,
	/// Pairs with `send_initial_events`: start no older than the supplied
	/// resource version.
	pub resource_version_match_not_older_than: bool,
	pub allow_bookmarks: bool,
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
	pub field_manager: String,
	pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
	pub grace_period_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
	pub container: Option<String>,
	pub follow: bool,
	pub tail_lines: Option<i64>,
	pub since_seconds: Option<i64>,
	pub previous: bool,
	pub timestamps: bool,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
	pub namespace: String,
	pub pod: String,
	pub container: Option<String>,
	pub command: Vec<String>,
	pub tty: bool,
}

#[derive(Debug, Clone)]
pub struct PortForwardOptions {
	pub namespace: String,
	pub pod: String,
	pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEventType {
	Added,
	Modified,
	Deleted,
	Bookmark,
	Error,
}

/// One event on a watch stream. Produced once at the adapter boundary;
/// nothing downstream sees the client library's own event types.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WatchEvent {
	#[serde(rename = "type")]
	pub event_type: WatchEventType,
	pub object: serde_json::Value,
}

impl WatchEvent {
	pub fn error(message: impl Into<String>) -> Self {
		WatchEvent {
			event_type: WatchEventType::Error,
			object: serde_json::json!({ "message": message.into() }),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn watch_event_wire_shape() {
		let ev = WatchEvent {
			event_type: WatchEventType::Added,
			object: serde_json::json!({"kind": "Pod"}),
		};
		let json = serde_json::to_value(&ev).unwrap();
		assert_eq!(json["type"], "ADDED");
		assert_eq!(json["object"]["kind"], "Pod");
	}

	#[test]
	fn gvr_display() {
		assert_eq!(Gvr::new("", "v1", "pods").to_string(), "v1/pods");
		assert_eq!(
			Gvr::new("apps", "v1", "deployments").to_string(),
			"apps/v1/deployments"
		);
	}
}
