use std::sync::Arc;
use std::time::Duration;

use include_dir::{Dir, include_dir};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backend::{ApplyOptions, KubeBackend};
use crate::errors::{Code, DomainError, Error};
use crate::identity::UserInfo;

/// Field manager recorded by bootstrap applies. SSA field ownership under a
/// stable manager name is what makes repeated bootstraps no-ops.
pub const FIELD_MANAGER: &str = "fleetgate-agent";

const ESTABLISHED_POLL_INTERVAL: Duration = Duration::from_secs(2);
const ESTABLISHED_DEADLINE: Duration = Duration::from_secs(60);

/// Manifests compiled into the agent, applied at startup when bootstrap is
/// enabled. Files apply in lexicographic order.
static BOOTSTRAP_MANIFESTS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/manifests");

/// Two-phase server-side applier: CRDs first, then a gated wait until each
/// reports `Established=True`, then everything else in document order
/// against a refreshed REST mapping.
pub struct Bootstrapper {
	backend: Arc<dyn KubeBackend>,
}

impl Bootstrapper {
	pub fn new(backend: Arc<dyn KubeBackend>) -> Self {
		Bootstrapper { backend }
	}

	pub async fn run(&self) -> Result<(), Error> {
		let documents = embedded_documents()?;
		self.apply_documents(documents).await
	}

	async fn apply_documents(&self, documents: Vec<serde_json::Value>) -> Result<(), Error> {
		let (crds, rest): (Vec<_>, Vec<_>) = documents
			.into_iter()
			.partition(|doc| doc["kind"] == "CustomResourceDefinition");

		let user = UserInfo::local();
		let opts = ApplyOptions {
			field_manager: FIELD_MANAGER.to_string(),
			force: true,
		};

		for crd in &crds {
			self
				.backend
				.apply_object(&user, crd.clone(), opts.clone())
				.await?;
		}
		for crd in &crds {
			self.wait_established(&user, crd).await?;
		}
		if !crds.is_empty() {
			// New CRDs mean new REST mappings; phase two must not apply
			// through a mapper that predates them.
			self.backend.invalidate_discovery().await;
		}

		for doc in &rest {
			self
				.backend
				.apply_object(&user, doc.clone(), opts.clone())
				.await?;
		}
		info!(
			"bootstrap applied {} CRDs and {} objects",
			crds.len(),
			rest.len()
		);
		Ok(())
	}

	async fn wait_established(&self, user: &UserInfo, crd: &serde_json::Value) -> Result<(), Error> {
		let name = crd
			.pointer("/metadata/name")
			.and_then(|v| v.as_str())
			.ok_or_else(|| Error::invalid_input("object", "CRD has no metadata.name"))?;
		let deadline = Instant::now() + ESTABLISHED_DEADLINE;
		loop {
			match self
				.backend
				.get_object(
					user,
					"apiextensions.k8s.io/v1",
					"CustomResourceDefinition",
					None,
					name,
				)
				.await
			{
				Ok(obj) if is_established(&obj) => {
					debug!("CRD {name} is established");
					return Ok(());
				},
				Ok(_) => debug!("CRD {name} not yet established"),
				Err(e) => debug!("CRD {name} poll failed: {e}"),
			}
			if Instant::now() + ESTABLISHED_POLL_INTERVAL > deadline {
				return Err(DomainError::new(
					Code::DeadlineExceeded,
					format!("CRD {name} did not become established"),
				)
				.into());
			}
			tokio::time::sleep(ESTABLISHED_POLL_INTERVAL).await;
		}
	}
}

fn is_established(crd: &serde_json::Value) -> bool {
	crd
		.pointer("/status/conditions")
		.and_then(|c| c.as_array())
		.is_some_and(|conditions| {
			conditions
				.iter()
				.any(|c| c["type"] == "Established" && c["status"] == "True")
		})
}

/// All embedded documents, file order lexicographic, empty documents
/// skipped.
fn embedded_documents() -> Result<Vec<serde_json::Value>, Error> {
	let mut files: Vec<_> = BOOTSTRAP_MANIFESTS.files().collect();
	files.sort_by_key(|f| f.path().to_path_buf());
	let mut documents = Vec::new();
	for file in files {
		let contents = file
			.contents_utf8()
			.ok_or_else(|| Error::internal(format!("{}: not UTF-8", file.path().display())))?;
		documents.extend(parse_multi_doc(contents).map_err(|e| {
			Error::internal(format!("{}: {e}", file.path().display()))
		})?);
	}
	Ok(documents)
}

fn parse_multi_doc(yaml: &str) -> Result<Vec<serde_json::Value>, String> {
	let mut documents = Vec::new();
	for doc in serde_yaml::Deserializer::from_str(yaml) {
		let value = serde_json::Value::deserialize(doc).map_err(|e| e.to_string())?;
		if value.is_null() {
			continue;
		}
		documents.push(value);
	}
	Ok(documents)
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::Ordering;

	use super::*;
	use crate::backend::testing::StubBackend;

	#[test]
	fn embedded_manifests_parse_and_partition() {
		let docs = embedded_documents().unwrap();
		assert!(docs.len() >= 3);
		let crds: Vec<_> = docs
			.iter()
			.filter(|d| d["kind"] == "CustomResourceDefinition")
			.collect();
		assert_eq!(crds.len(), 1);
		assert_eq!(
			crds[0]["metadata"]["name"],
			"clusterprofiles.fleetgate.io"
		);
	}

	#[test]
	fn multi_doc_parsing_skips_empty_documents() {
		let docs = parse_multi_doc("a: 1\n---\n---\nb: 2\n").unwrap();
		assert_eq!(docs.len(), 2);
		assert!(parse_multi_doc("a: [unclosed").is_err());
	}

	#[tokio::test]
	async fn crds_apply_first_then_rest_after_invalidation() {
		let backend = Arc::new(StubBackend::default());
		let bootstrapper = Bootstrapper::new(backend.clone());
		bootstrapper.run().await.unwrap();

		let applied = backend.applied_objects.lock().unwrap().clone();
		assert_eq!(
			applied[0],
			"CustomResourceDefinition/clusterprofiles.fleetgate.io"
		);
		assert!(applied.contains(&"Namespace/fleetgate-system".to_string()));
		assert!(applied.contains(&"ClusterProfile/default".to_string()));
		assert!(backend.discovery_invalidated.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn established_wait_polls_until_true() {
		let backend = Arc::new(StubBackend::default());
		// Two polls return not-established before the condition flips.
		backend.established_after.store(2, Ordering::SeqCst);
		tokio::time::pause();
		let bootstrapper = Bootstrapper::new(backend.clone());
		let run = tokio::spawn(async move { bootstrapper.run().await });
		// Advance virtual time past the poll interval until completion.
		for _ in 0..5 {
			tokio::time::advance(ESTABLISHED_POLL_INTERVAL).await;
			tokio::task::yield_now().await;
		}
		run.await.unwrap().unwrap();
	}

	#[test]
	fn established_condition_detection() {
		let yes = serde_json::json!({"status": {"conditions": [
			{"type": "Established", "status": "True"}
		]}});
		let no = serde_json::json!({"status": {"conditions": [
			{"type": "Established", "status": "False"}
		]}});
		assert!(is_established(&yes));
		assert!(!is_established(&no));
		assert!(!is_established(&serde_json::json!({})));
	}
}
