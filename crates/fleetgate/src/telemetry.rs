use std::sync::{Arc, Mutex};

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Gateway-wide metrics, exported on `/metrics`.
#[derive(Debug)]
pub struct Metrics {
	registry: Mutex<Registry>,
	pub connected_clusters: Gauge,
	pub active_exec_sessions: Gauge,
	pub active_port_forward_sessions: Gauge,
	pub proxied_rpcs: Counter,
	pub signed_csrs: Counter,
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

impl Metrics {
	pub fn new() -> Self {
		let mut registry = Registry::default();
		let connected_clusters = Gauge::default();
		registry.register(
			"fleet_connected_clusters",
			"Clusters with an active reverse tunnel",
			connected_clusters.clone(),
		);
		let active_exec_sessions = Gauge::default();
		registry.register(
			"fleet_active_exec_sessions",
			"Exec sessions currently tracked by the session store",
			active_exec_sessions.clone(),
		);
		let active_port_forward_sessions = Gauge::default();
		registry.register(
			"fleet_active_port_forward_sessions",
			"Port-forward sessions currently tracked by the session store",
			active_port_forward_sessions.clone(),
		);
		let proxied_rpcs = Counter::default();
		registry.register(
			"fleet_proxied_rpcs",
			"RPCs forwarded to agents through the reverse tunnel",
			proxied_rpcs.clone(),
		);
		let signed_csrs = Counter::default();
		registry.register(
			"fleet_signed_csrs",
			"Agent certificate-signing requests fulfilled",
			signed_csrs.clone(),
		);
		Metrics {
			registry: Mutex::new(registry),
			connected_clusters,
			active_exec_sessions,
			active_port_forward_sessions,
			proxied_rpcs,
			signed_csrs,
		}
	}

	pub fn encode_text(&self) -> String {
		let mut out = String::new();
		let registry = self.registry.lock().expect("metrics registry poisoned");
		if let Err(e) = encode(&mut out, &registry) {
			tracing::warn!("failed to encode metrics: {e}");
		}
		out
	}
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_includes_registered_metrics() {
		let metrics = Metrics::new();
		metrics.connected_clusters.set(2);
		metrics.proxied_rpcs.inc();
		let text = metrics.encode_text();
		assert!(text.contains("fleet_connected_clusters 2"));
		assert!(text.contains("fleet_proxied_rpcs_total 1"));
	}
}
