use axum::{
    Json,
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;

use crate::admin::{AdminSession, EngineStats};
use crate::server::{ApiError, AppState};

#[derive(Debug, Deserialize, Default)]
pub struct EventsQuery {
    /// Only forward events of this session
    pub session: Option<String>,
}

pub async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.manager.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |result| {
        let session = query.session.clone();
        async move {
            match result {
                Ok(event) => {
                    if session.is_some_and(|s| s != event.session_id()) {
                        return None;
                    }
                    let json = serde_json::to_string(&event).ok()?;
                    Some(Ok(Event::default().data(json)))
                }
                // Lagged receivers skip what they missed
                Err(_) => None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize, Default)]
pub struct SessionsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<AdminSession>,
    pub stats: EngineStats,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

pub async fn sessions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let meta = state.manager.list_sessions().await?;
    let active: HashSet<String> = state
        .manager
        .active_sessions()
        .iter()
        .map(|id| id.to_string())
        .collect();

    let rows: Vec<AdminSession> = meta
        .iter()
        .map(|m| AdminSession::from_meta(m, active.contains(m.session_id.as_str())))
        .collect();
    let stats = EngineStats::from_sessions(&rows, &meta);
    let total = rows.len();

    let sessions = rows
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .collect();

    Ok(Json(SessionsResponse {
        sessions,
        stats,
        total,
        limit: query.limit,
        offset: query.offset,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeflateCodec;
    use crate::config::{GraderConfig, MemoryConfig, ServerConfig};
    use crate::grader::GraderAdapter;
    use crate::memory::MemoryManager;
    use crate::server::create_router;
    use crate::session::SessionId;
    use crate::storage::InMemoryStore;
    use crate::testing::MockGrader;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        let config = MemoryConfig::default();
        let adapter =
            GraderAdapter::new(Arc::new(MockGrader::fixed(8)), &config, &GraderConfig::default());
        Arc::new(AppState {
            manager: Arc::new(MemoryManager::new(
                config,
                Arc::new(DeflateCodec::default()),
                adapter,
                Arc::new(InMemoryStore::new()),
            )),
            config: ServerConfig::default(),
        })
    }

    #[tokio::test]
    async fn test_sessions_listing_marks_active() {
        let state = state();
        let a = SessionId::try_from("adm-a").unwrap();
        let b = SessionId::try_from("adm-b").unwrap();
        state.manager.start_session(Some(a.clone()), None).await.unwrap();
        state.manager.start_session(Some(b.clone()), None).await.unwrap();
        state.manager.end_session(&b).await.unwrap();

        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .uri("/admin/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: SessionsResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.total, 2);
        assert_eq!(body.stats.active_sessions, 1);
        let a_row = body
            .sessions
            .iter()
            .find(|s| s.session_id == "adm-a")
            .unwrap();
        assert!(a_row.active);
    }

    #[tokio::test]
    async fn test_events_endpoint_is_sse() {
        let response = create_router(state())
            .oneshot(
                Request::builder()
                    .uri("/admin/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("text/event-stream"));
    }
}
