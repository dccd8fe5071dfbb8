//! Relay service: the public rendezvous between clients and devices.
//!
//! The relay:
//! 1. Keeps the device registry fresh via `/register` and `/heartbeat/{id}`
//! 2. Queues client requests per device (`/proxy/send`) and hands them out on
//!    device long-polls (`/proxy/poll/{id}`)
//! 3. Correlates device answers (`/proxy/respond`) with waiting clients
//!    (`/proxy/await/{request_id}`), or does both halves at once for plain HTTP
//!    callers on `/d/{device_id}/*`

use std::future::Future;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{any, delete, get, post},
    Extension, Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{require_relay_key, RelayKey};
use crate::routes::{devices, health, proxy};
use crate::RelayState;

/// JSON framing allowance on top of the base64-expanded body limit.
const ENVELOPE_OVERHEAD: usize = 64 * 1024;

/// Build the relay router with all endpoints.
pub fn relay_router(state: RelayState) -> Router {
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/", get(health::root));

    let device_routes = Router::new()
        .route("/register", post(devices::register))
        .route("/heartbeat/{device_id}", post(devices::heartbeat))
        .route("/unregister/{device_id}", delete(devices::unregister))
        .route("/devices", get(devices::list_all))
        .route("/devices/{email}", get(devices::list_by_email));

    let mailbox_routes = Router::new()
        .route("/send", post(proxy::send))
        .route("/proxy/send", post(proxy::send))
        .route("/poll/{device_id}", get(proxy::poll))
        .route("/proxy/poll/{device_id}", get(proxy::poll))
        .route("/proxy/respond", post(proxy::respond))
        .route("/proxy/await/{request_id}", get(proxy::await_response))
        .route("/proxy/requests/{request_id}", delete(proxy::abandon))
        .route("/proxy/{device_id}/upload", post(proxy::upload))
        .route("/d/{device_id}/{*path}", any(proxy::transparent));

    let authed = device_routes
        .merge(mailbox_routes)
        .layer(middleware::from_fn(require_relay_key));

    let server = &state.config.server;
    let raw_body_limit = server.max_body_bytes.saturating_mul(4) / 3 + ENVELOPE_OVERHEAD;
    let max_concurrent = server.max_concurrent_requests.max(1);

    Router::new()
        .merge(public)
        .merge(authed)
        .layer(Extension(RelayKey(state.config.auth.relay_key.clone())))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(raw_body_limit))
        .layer(ConcurrencyLimitLayer::new(max_concurrent))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, relay_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Periodically expire requests older than `relay.dispatch_ttl_secs`.
pub fn spawn_sweeper(state: RelayState) -> JoinHandle<()> {
    let ttl = Duration::from_secs(state.config.relay.dispatch_ttl_secs);
    let every = Duration::from_secs(state.config.relay.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let expired = state.mailbox.sweep_expired(ttl).await;
            if expired > 0 {
                info!(expired, "Swept expired requests");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::Config;
    use crate::envelope::{RequestEnvelope, ResponseEnvelope};

    fn test_state(configure: impl FnOnce(&mut Config)) -> RelayState {
        let mut config = Config::default();
        configure(&mut config);
        RelayState::new(config)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = bearer {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn registration(id: &str) -> Value {
        json!({"device_id": id, "email": "owner@x.io", "device_name": "Pixel", "port": 8080})
    }

    #[tokio::test]
    async fn relay_key_guards_everything_but_health() {
        let app = relay_router(test_state(|c| c.auth.relay_key = Some("k".into())));

        let (status, body) = call(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, _) = call(&app, "GET", "/devices", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&app, "GET", "/devices", None, Some("wrong")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app, "GET", "/devices", None, Some("k")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn send_poll_respond_await_round_trip() {
        let app = relay_router(test_state(|_| {}));
        let (status, _) = call(&app, "POST", "/register", Some(registration("D1")), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, accepted) = call(
            &app,
            "POST",
            "/proxy/send",
            Some(json!({"from_device": "desk", "device_id": "D1", "method": "GET", "path": "/api/files", "params": {"path": ""}})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(accepted["status"], "accepted");
        let request_id = accepted["request_id"].as_str().unwrap().to_string();

        let (_, polled) = call(&app, "GET", "/proxy/poll/D1?wait_ms=10", None, None).await;
        let requests = polled["requests"].as_array().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["path"], "/api/files");

        let mut answer = ResponseEnvelope::new(&request_id, 200, br#"{"files":[]}"#, "application/json");
        answer.device_id = Some("D1".into());
        let (status, ack) = call(
            &app,
            "POST",
            "/proxy/respond",
            Some(serde_json::to_value(&answer).unwrap()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["delivered"], true);

        let (status, resolved) = call(
            &app,
            "GET",
            &format!("/proxy/await/{request_id}?timeout_ms=100"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolved["status_code"], 200);

        // A second answer for the same id is acknowledged but dropped.
        let (status, ack) = call(
            &app,
            "POST",
            "/proxy/respond",
            Some(serde_json::to_value(&answer).unwrap()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["delivered"], false);
    }

    #[tokio::test]
    async fn send_to_unregistered_device_is_not_found() {
        let app = relay_router(test_state(|_| {}));
        let (status, body) = call(
            &app,
            "POST",
            "/proxy/send",
            Some(json!({"device_id": "ghost", "path": "/x"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "DEVICE_NOT_FOUND");
    }

    #[tokio::test]
    async fn permissive_relay_queues_for_unknown_devices() {
        let state = test_state(|c| c.relay.reject_unknown_devices = false);
        let app = relay_router(state.clone());
        let (status, _) = call(
            &app,
            "POST",
            "/send",
            Some(json!({"device_id": "later", "path": "/x"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.mailbox.pending_count("later").await, 1);
    }

    #[tokio::test]
    async fn malformed_send_is_rejected_before_queueing() {
        let state = test_state(|_| {});
        let app = relay_router(state.clone());
        call(&app, "POST", "/register", Some(registration("D1")), None).await;

        for bad in [
            json!({"device_id": "D1", "method": "BREW", "path": "/x"}),
            json!({"device_id": "D1", "path": "no-slash"}),
            json!({"device_id": "D1", "path": "/x", "body": "%%%"}),
        ] {
            let (status, body) = call(&app, "POST", "/proxy/send", Some(bad), None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["code"], "INVALID_REQUEST");
        }
        assert_eq!(state.mailbox.pending_count("D1").await, 0);
    }

    #[tokio::test]
    async fn responder_must_be_the_target_device() {
        let state = test_state(|_| {});
        let app = relay_router(state.clone());
        call(&app, "POST", "/register", Some(registration("D1")), None).await;
        let request_id = state
            .mailbox
            .enqueue(RequestEnvelope::new("D1", "GET", "/x"))
            .await
            .unwrap();
        state.mailbox.poll("D1", Duration::ZERO).await;

        let mut answer = ResponseEnvelope::new(&request_id, 200, b"", "text/plain");
        answer.device_id = Some("D2".into());
        let (status, body) = call(
            &app,
            "POST",
            "/proxy/respond",
            Some(serde_json::to_value(&answer).unwrap()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "DEVICE_MISMATCH");
    }

    #[tokio::test]
    async fn respond_without_device_id_is_rejected() {
        let state = test_state(|_| {});
        let app = relay_router(state.clone());
        call(&app, "POST", "/register", Some(registration("D1")), None).await;
        let request_id = state
            .mailbox
            .enqueue(RequestEnvelope::new("D1", "GET", "/x"))
            .await
            .unwrap();
        state.mailbox.poll("D1", Duration::ZERO).await;

        let answer = ResponseEnvelope::new(&request_id, 200, b"", "text/plain");
        let (status, body) = call(
            &app,
            "POST",
            "/proxy/respond",
            Some(serde_json::to_value(&answer).unwrap()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");
        assert_eq!(state.mailbox.stats().await.outstanding, 1);
    }

    #[tokio::test]
    async fn heartbeat_unknown_then_register_and_unregister() {
        let app = relay_router(test_state(|_| {}));
        let (status, _) = call(&app, "POST", "/heartbeat/D1", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(&app, "POST", "/register", Some(registration("D1")), None).await;
        let (status, _) = call(&app, "POST", "/heartbeat/D1", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(
            &app,
            "POST",
            "/heartbeat/D1",
            Some(json!({"local_ip": "10.0.0.9"})),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, listed) = call(&app, "GET", "/devices/owner@x.io", None, None).await;
        assert_eq!(listed["devices"][0]["local_ip"], "10.0.0.9");
        assert_eq!(listed["devices"][0]["online"], true);

        let (status, _) = call(&app, "DELETE", "/unregister/D1", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, listed) = call(&app, "GET", "/devices", None, None).await;
        assert_eq!(listed["devices"][0]["online"], false);
    }

    #[tokio::test]
    async fn transparent_proxy_unknown_and_offline() {
        let app = relay_router(test_state(|_| {}));
        let (status, _) = call(&app, "GET", "/d/ghost/api/files", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(&app, "POST", "/register", Some(registration("D1")), None).await;
        call(&app, "DELETE", "/unregister/D1", None, None).await;
        let (status, body) = call(&app, "GET", "/d/D1/api/files", None, None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "DEVICE_OFFLINE");
    }

    #[tokio::test(start_paused = true)]
    async fn transparent_proxy_times_out_with_504() {
        let state = test_state(|c| c.relay.proxy_timeout_secs = 2);
        let app = relay_router(state.clone());
        call(&app, "POST", "/register", Some(registration("D1")), None).await;

        let (status, body) = call(&app, "GET", "/d/D1/api/slow", None, None).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body["code"], "TIMEOUT");
        assert_eq!(state.mailbox.stats().await.outstanding, 0);
    }

    #[tokio::test]
    async fn transparent_proxy_replays_device_answer() {
        let state = test_state(|_| {});
        let app = relay_router(state.clone());
        call(&app, "POST", "/register", Some(registration("D1")), None).await;

        let device = state.mailbox.clone();
        let responder = tokio::spawn(async move {
            let batch = device.poll("D1", Duration::from_secs(5)).await;
            let req = &batch[0];
            assert_eq!(req.method, "POST");
            assert_eq!(req.path, "/api/notes");
            assert_eq!(req.params.get("tag").map(String::as_str), Some("x"));
            assert_eq!(req.body_bytes().unwrap(), b"note");
            device
                .resolve(ResponseEnvelope::new(&req.request_id, 201, b"created", "text/plain"))
                .await
                .unwrap();
        });

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/d/D1/api/notes?tag=x")
                    .body(Body::from("note"))
                    .unwrap(),
            )
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/plain");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"created");
    }

    fn multipart_request(uri: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
        let boundary = "burrow-test-boundary";
        let mut body = Vec::new();
        for (name, filename, data) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            let disposition = match filename {
                Some(f) => format!("form-data; name=\"{name}\"; filename=\"{f}\""),
                None => format!("form-data; name=\"{name}\""),
            };
            body.extend_from_slice(format!("Content-Disposition: {disposition}\r\n\r\n").as_bytes());
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_is_relayed_with_its_file_name() {
        let state = test_state(|_| {});
        let app = relay_router(state.clone());
        call(&app, "POST", "/register", Some(registration("D1")), None).await;

        let device = state.mailbox.clone();
        let responder = tokio::spawn(async move {
            let batch = device.poll("D1", Duration::from_secs(5)).await;
            let req = &batch[0];
            assert_eq!(req.method, "POST");
            assert_eq!(req.path, "/api/files/upload");
            assert_eq!(req.params.get("path").map(String::as_str), Some("/sdcard/DCIM"));
            assert_eq!(req.filename.as_deref(), Some("cat.jpg"));
            assert_eq!(req.body_bytes().unwrap(), b"\xff\xd8jpeg");
            let mut answer = ResponseEnvelope::new(&req.request_id, 200, br#"{"ok":true}"#, "application/json");
            answer.device_id = Some("D1".into());
            device.resolve(answer).await.unwrap();
        });

        let request = multipart_request(
            "/proxy/D1/upload",
            &[
                ("path", None, &b"/sdcard/DCIM"[..]),
                ("file", Some("cat.jpg"), &b"\xff\xd8jpeg"[..]),
            ],
        );
        let response = app.clone().oneshot(request).await.unwrap();
        responder.await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn upload_without_file_is_rejected() {
        let state = test_state(|_| {});
        let app = relay_router(state.clone());
        call(&app, "POST", "/register", Some(registration("D1")), None).await;

        let request = multipart_request("/proxy/D1/upload", &[("path", None, &b"/sdcard"[..])]);
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.mailbox.pending_count("D1").await, 0);

        let request = multipart_request("/proxy/ghost/upload", &[("file", Some("a.txt"), &b"a"[..])]);
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn abandon_unknown_request_is_not_found() {
        let app = relay_router(test_state(|_| {}));
        let (status, body) = call(&app, "DELETE", "/proxy/requests/nope", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "REQUEST_NOT_FOUND");
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_expires_unclaimed_requests() {
        let state = test_state(|c| {
            c.relay.dispatch_ttl_secs = 5;
            c.relay.sweep_interval_secs = 1;
        });
        state
            .mailbox
            .enqueue(RequestEnvelope::new("D1", "GET", "/x"))
            .await
            .unwrap();
        let sweeper = spawn_sweeper(state.clone());

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(state.mailbox.pending_count("D1").await, 0);
        assert_eq!(state.mailbox.stats().await.expired_total, 1);
        sweeper.abort();
    }
}
