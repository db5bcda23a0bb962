mod common;

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::{Harness, bearer_token, eventually, forge_manifest_token};
use fleetgate::rpc::paths;

fn unix_now() -> i64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap()
		.as_secs() as i64
}

#[tokio::test]
async fn register_resolve_and_proxy_list() {
	let harness = Harness::start().await;
	let registration = harness.connect_agent("dev", "host-1").await;
	assert!(!registration.endpoint.is_empty());

	// The signed cert chains back to the CA the server advertises.
	let (_, cert_pem) =
		x509_parser::pem::parse_x509_pem(registration.cert_pem.as_bytes()).unwrap();
	let cert = cert_pem.parse_x509().unwrap();
	let (_, ca_pem) = x509_parser::pem::parse_x509_pem(harness.ca_cert_pem.as_bytes()).unwrap();
	let ca = ca_pem.parse_x509().unwrap();
	cert
		.verify_signature(Some(ca.public_key()))
		.expect("agent cert must chain to the fleet CA");
	assert_eq!(registration.ca_cert_pem, harness.ca_cert_pem);

	// A proxied List reaches the stub backend impersonating the caller.
	let token = bearer_token("alice");
	let (status, body) = harness
		.post(
			paths::RESOURCE_LIST,
			Some(&token),
			serde_json::json!({
				"cluster": "dev",
				"group": "",
				"version": "v1",
				"resource": "pods",
				"namespace": "default",
			}),
		)
		.await;
	assert_eq!(status, http::StatusCode::OK, "{body:?}");
	let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
	let items = response["object"]["items"].as_array().unwrap();
	assert_eq!(items.len(), 2);
	// Handler-side scrubbing happened on the agent.
	assert!(items[0]["metadata"].get("managedFields").is_none());
	assert!(
		harness
			.backend
			.impersonated
			.lock()
			.unwrap()
			.iter()
			.all(|s| s == "alice")
	);

	// The cluster shows up, connected, in ListClusters.
	let (status, body) = harness
		.post(paths::FLEET_LIST_CLUSTERS, Some(&token), serde_json::json!({}))
		.await;
	assert_eq!(status, http::StatusCode::OK);
	let response: serde_json::Value = serde_json::from_slice(&body).unwrap();
	let clusters = response["clusters"].as_array().unwrap();
	assert_eq!(clusters.len(), 1);
	assert_eq!(clusters[0]["name"], "dev");
	assert_eq!(clusters[0]["connected"], true);
}

#[tokio::test]
async fn register_rejects_invalid_cluster_name() {
	let harness = Harness::start().await;
	let csr = fleetgate::pki::CsrOptions {
		common_name: "host-1".into(),
	}
	.generate()
	.unwrap();
	let err = harness
		.register("UPPER", "host-1", &csr.csr_pem)
		.await
		.unwrap_err();
	assert_eq!(err.code(), fleetgate::Code::InvalidArgument);
	assert!(err.to_string().contains("must match"), "got {err}");
}

#[tokio::test]
async fn manifest_download_is_token_gated() {
	let harness = Harness::start().await;
	let now = unix_now();

	let valid = forge_manifest_token(&harness.hmac_key, "alice", "dev", now, now + 3600);
	let (status, body) = harness.get(&format!("/fleet/manifest/{valid}")).await;
	assert_eq!(status, http::StatusCode::OK);
	let yaml = std::str::from_utf8(&body).unwrap();
	assert!(yaml.contains("fleetgate.io/cluster: dev"));
	assert!(yaml.contains("kind: Deployment"));

	// Expired token: opaque 401, no hint that expiry was the reason.
	let expired = forge_manifest_token(&harness.hmac_key, "alice", "dev", now - 3700, now - 100);
	let (status, body) = harness.get(&format!("/fleet/manifest/{expired}")).await;
	assert_eq!(status, http::StatusCode::UNAUTHORIZED);
	assert_eq!(&body[..], b"invalid or expired token");

	// Tampered token: byte-identical refusal.
	let tampered = valid.replace('.', "x");
	let (status, body) = harness.get(&format!("/fleet/manifest/{tampered}")).await;
	assert_eq!(status, http::StatusCode::UNAUTHORIZED);
	assert_eq!(&body[..], b"invalid or expired token");
}

#[tokio::test]
async fn exec_session_lifecycle_through_the_proxy() {
	let harness = Harness::start().await;
	harness.connect_agent("exec-dev", "host-1").await;
	let token = bearer_token("alice");

	let mut stream = harness
		.post_stream(
			paths::RUNTIME_EXECUTE_TTY,
			&token,
			serde_json::json!({
				"cluster": "exec-dev",
				"namespace": "default",
				"name": "shell",
				"command": ["sh"],
				"tty": false,
			}),
		)
		.await;

	let first = stream.next_frame().await.expect("first frame");
	let session_id = first["value"]["sessionId"]
		.as_str()
		.expect("first frame carries the session id")
		.to_string();

	let (status, _) = harness
		.post(
			paths::RUNTIME_WRITE_TTY,
			Some(&token),
			serde_json::json!({
				"cluster": "exec-dev",
				"sessionId": session_id,
				"stdin": STANDARD.encode(b"ls\n"),
			}),
		)
		.await;
	assert_eq!(status, http::StatusCode::OK);

	// The stub echoes stdin to stdout; it comes back base64-framed.
	let frame = stream.next_frame().await.expect("stdout frame");
	let stdout = frame["value"]["stdout"].as_str().unwrap();
	assert_eq!(STANDARD.decode(stdout).unwrap(), b"ls\n");

	let (status, _) = harness
		.post(
			paths::RUNTIME_RESIZE_TTY,
			Some(&token),
			serde_json::json!({
				"cluster": "exec-dev",
				"sessionId": session_id,
				"rows": 24,
				"cols": 80,
			}),
		)
		.await;
	assert_eq!(status, http::StatusCode::OK);

	assert_eq!(harness.store.exec_count(), 1);
	drop(stream);
	// Closing the client stream triggers cleanup on the agent.
	let store = harness.store.clone();
	assert!(
		eventually(Duration::from_secs(5), move || store.exec_count() == 0).await,
		"session must be removed after the stream closes"
	);

	// Writes to the now-cleaned session are NotFound.
	let (status, _) = harness
		.post(
			paths::RUNTIME_WRITE_TTY,
			Some(&token),
			serde_json::json!({
				"cluster": "exec-dev",
				"sessionId": session_id,
				"stdin": STANDARD.encode(b"x"),
			}),
		)
		.await;
	assert_eq!(status, http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn watch_streams_events_and_signals_closure() {
	let harness = Harness::start().await;
	harness
		.backend
		.watch_script
		.lock()
		.unwrap()
		.push(fleetgate::backend::testing::watch_added("one"));
	harness.connect_agent("watch-dev", "host-1").await;

	let token = bearer_token("alice");
	let mut stream = harness
		.post_stream(
			paths::RESOURCE_WATCH,
			&token,
			serde_json::json!({
				"cluster": "watch-dev",
				"group": "",
				"version": "v1",
				"resource": "pods",
				"namespace": "default",
			}),
		)
		.await;

	let frame = stream.next_frame().await.expect("watch event");
	assert_eq!(frame["value"]["type"], "ADDED");
	assert_eq!(frame["value"]["object"]["metadata"]["name"], "one");
	assert!(
		frame["value"]["object"]["metadata"]
			.get("managedFields")
			.is_none(),
		"watch objects are scrubbed too"
	);

	// The scripted watch ends; the closure becomes a terminal error frame.
	let last = stream.next_frame().await.expect("terminal frame");
	assert_eq!(last["error"]["code"], "unavailable");
	assert!(
		last["error"]["message"]
			.as_str()
			.unwrap()
			.contains("watch closed")
	);
}

#[tokio::test]
async fn unauthenticated_requests_never_reach_the_agent() {
	let harness = Harness::start().await;
	harness.connect_agent("auth-dev", "host-1").await;

	let (status, _) = harness
		.post(
			paths::RESOURCE_LIST,
			None,
			serde_json::json!({
				"cluster": "auth-dev",
				"version": "v1",
				"resource": "pods",
			}),
		)
		.await;
	assert_eq!(status, http::StatusCode::UNAUTHORIZED);
	assert!(
		harness.backend.impersonated.lock().unwrap().is_empty(),
		"no call may reach the backend without authentication"
	);

	let (status, _) = harness
		.post(
			paths::RESOURCE_LIST,
			Some("garbage-token"),
			serde_json::json!({"cluster": "auth-dev", "version": "v1", "resource": "pods"}),
		)
		.await;
	assert_eq!(status, http::StatusCode::UNAUTHORIZED);
	assert!(harness.backend.impersonated.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_cluster_is_not_found_and_disconnected_cluster_unavailable() {
	let harness = Harness::start().await;
	let token = bearer_token("alice");

	let (status, _) = harness
		.post(
			paths::RESOURCE_LIST,
			Some(&token),
			serde_json::json!({"cluster": "ghost", "version": "v1", "resource": "pods"}),
		)
		.await;
	assert_eq!(status, http::StatusCode::NOT_FOUND);

	// Registered but no tunnel dialed: the readiness probe times out.
	let csr = fleetgate::pki::CsrOptions {
		common_name: "host-1".into(),
	}
	.generate()
	.unwrap();
	harness
		.register("silent", "host-1", &csr.csr_pem)
		.await
		.unwrap();
	let (status, body) = harness
		.post(
			paths::RESOURCE_LIST,
			Some(&token),
			serde_json::json!({"cluster": "silent", "version": "v1", "resource": "pods"}),
		)
		.await;
	assert_eq!(status, http::StatusCode::SERVICE_UNAVAILABLE, "{body:?}");
}

#[tokio::test]
async fn tunnel_refuses_wrong_credentials() {
	use hyper_util::rt::TokioIo;

	let harness = Harness::start().await;
	// A real registration yields a valid client cert for the mTLS layer.
	let csr = fleetgate::pki::CsrOptions {
		common_name: "host-1".into(),
	}
	.generate()
	.unwrap();
	let registration = harness.register("locked", "host-1", &csr.csr_pem).await.unwrap();

	let tls_config = fleetgate::tunnel::tunnel_client_config(
		&registration.ca_cert_pem,
		&registration.cert_pem,
		&csr.key_pem,
	)
	.unwrap();
	let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(tls_config));
	let tcp = tokio::net::TcpStream::connect(harness.tunnel_addr).await.unwrap();
	let tls = connector
		.connect(
			rustls_pki_types::ServerName::try_from("localhost").unwrap(),
			tcp,
		)
		.await
		.expect("mTLS handshake with a CA-signed cert succeeds");

	let (mut sender, conn) = hyper::client::conn::http1::handshake::<
		_,
		http_body_util::Empty<bytes::Bytes>,
	>(TokioIo::new(tls))
	.await
	.unwrap();
	tokio::spawn(conn);

	let request = http::Request::builder()
		.method(http::Method::GET)
		.uri("/tunnel")
		.header(http::header::HOST, "localhost")
		.header(http::header::CONNECTION, "upgrade")
		.header(http::header::UPGRADE, fleetgate::tunnel::TUNNEL_PROTOCOL)
		.header(
			http::header::AUTHORIZATION,
			Harness::basic_header("host-1", "wrong-password"),
		)
		.header(fleetgate::tunnel::CLUSTER_HEADER, "locked")
		.body(http_body_util::Empty::new())
		.unwrap();
	let response = sender.send_request(request).await.unwrap();
	assert_eq!(response.status(), http::StatusCode::UNAUTHORIZED);
}
