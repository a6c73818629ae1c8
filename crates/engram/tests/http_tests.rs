//! Integration tests for the HTTP API
//!
//! Every request goes through the full router (timeout and trace layers
//! included) via `oneshot`, so no port is bound.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use engram::codec::DeflateCodec;
use engram::config::{GraderConfig, MemoryConfig, ServerConfig};
use engram::grader::GraderAdapter;
use engram::memory::MemoryManager;
use engram::server::{AppState, create_router};
use engram::session::SessionId;
use engram::storage::{DurableStore, InMemoryStore};
use engram::testing::{MockGrader, corrupt_record, words};
use serde_json::{Value, json};
use tower::ServiceExt;

fn app() -> Router {
    app_with(Arc::new(InMemoryStore::new()))
}

fn app_with(durable: Arc<dyn DurableStore>) -> Router {
    let config = MemoryConfig {
        interval_turns: 2,
        min_recall_score: 0.0,
        ..MemoryConfig::default()
    };
    let grader =
        GraderAdapter::new(Arc::new(MockGrader::fixed(8)), &config, &GraderConfig::default());
    let manager = MemoryManager::new(
        config,
        Arc::new(DeflateCodec::default()),
        grader,
        durable,
    );
    create_router(Arc::new(AppState {
        manager: Arc::new(manager),
        config: ServerConfig::default(),
    }))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

mod session_lifecycle {
    use super::*;

    #[tokio::test]
    async fn full_conversation_over_http() {
        let app = app();

        let (status, body) = send(
            &app,
            "POST",
            "/v1/sessions",
            Some(json!({"session_id": "http-flow", "title": "HTTP"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["session_id"], "http-flow");

        let (status, first) = send(
            &app,
            "POST",
            "/v1/sessions/http-flow/turns",
            Some(json!({"prompt": "ethics?", "response": words("ethics", 60)})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["turn"], 1);
        assert_eq!(first["stored_record_id"], 1);
        assert!(first["reinjection"]["record_ids"].as_array().unwrap().is_empty());

        let (_, short) = send(
            &app,
            "POST",
            "/v1/sessions/http-flow/turns",
            Some(json!({"response": "ok"})),
        )
        .await;
        assert_eq!(short["filtered"]["reason"], "too_short");
        // turn 2 hits the interval and moves record 1 back into context
        assert_eq!(short["reinjection"]["trigger"], "interval");
        assert_eq!(short["reinjection"]["record_ids"], json!([1]));
        assert!(
            short["reinjection"]["context"]
                .as_str()
                .unwrap()
                .contains("ethics ethics")
        );

        let (status, recall) = send(
            &app,
            "POST",
            "/v1/sessions/http-flow/recall",
            Some(json!({"query": "ethics", "k": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(recall["memories"][0]["record_id"], 1);
        assert_eq!(recall["memories"][0]["state"], "reinjected");

        let (_, records) = send(&app, "GET", "/v1/sessions/http-flow/records", None).await;
        assert_eq!(records.as_array().unwrap().len(), 1);

        let (_, metrics) = send(&app, "GET", "/v1/sessions/http-flow/metrics", None).await;
        assert_eq!(metrics["turn_counter"], 2);
        assert_eq!(metrics["metrics"]["total_recalls"], 1);
        assert_eq!(metrics["live_tokens"], 0);

        let (status, ended) = send(&app, "DELETE", "/v1/sessions/http-flow", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ended["metrics"]["total_stores"], 1);

        let (status, _) = send(&app, "GET", "/v1/sessions/http-flow/metrics", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // the ended session can be brought back from the durable store
        let (status, resumed) =
            send(&app, "POST", "/v1/sessions/http-flow/resume", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resumed["turn_counter"], 2);
        assert_eq!(resumed["total_records"], 1);
    }

    #[tokio::test]
    async fn start_without_body_generates_id() {
        let app = app();
        let (status, body) = send(&app, "POST", "/v1/sessions", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(!body["session_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_deletes_persisted_data() {
        let app = app();
        send(&app, "POST", "/v1/sessions", Some(json!({"session_id": "gone"}))).await;

        let (status, _) = send(&app, "DELETE", "/v1/sessions/gone?purge=true", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, "POST", "/v1/sessions/gone/resume", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["type"], "session_not_found");
    }
}

mod errors {
    use super::*;

    #[tokio::test]
    async fn invalid_session_id_is_bad_request() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/v1/sessions",
            Some(json!({"session_id": "../etc"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_session");
    }

    #[tokio::test]
    async fn turn_on_unknown_session_is_not_found() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/v1/sessions/nobody/turns",
            Some(json!({"response": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["type"], "session_not_found");
    }

    #[tokio::test]
    async fn recall_over_corrupt_record_is_unprocessable() {
        let store = Arc::new(InMemoryStore::new());
        let app = app_with(store.clone());
        send(&app, "POST", "/v1/sessions", Some(json!({"session_id": "damaged"}))).await;
        send(
            &app,
            "POST",
            "/v1/sessions/damaged/turns",
            Some(json!({"response": words("ethics", 60)})),
        )
        .await;
        send(&app, "DELETE", "/v1/sessions/damaged", None).await;

        let id = SessionId::try_from("damaged").unwrap();
        store.save_record(&id, &corrupt_record(&id, 1, 1)).await.unwrap();

        let (status, _) = send(&app, "POST", "/v1/sessions/damaged/resume", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/v1/sessions/damaged/recall",
            Some(json!({"query": "ethics"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["type"], "corrupt_payload");
    }

    #[tokio::test]
    async fn admin_listing_counts_sessions() {
        let app = app();
        send(&app, "POST", "/v1/sessions", Some(json!({"session_id": "one"}))).await;
        send(&app, "POST", "/v1/sessions", Some(json!({"session_id": "two"}))).await;

        let (status, body) = send(&app, "GET", "/admin/sessions?limit=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["sessions"].as_array().unwrap().len(), 1);
        assert_eq!(body["stats"]["active_sessions"], 2);
    }
}
