//! Axum trigger surface: run a pass on demand, fetch the latest summary, health check.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use staysync_sync::{render_brief, SyncPipeline};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "staysync-web";

const DEFAULT_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Template)]
#[template(
    source = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>staysync</title></head>
<body>
<h1>staysync</h1>
<p>Sync running: {{ running }}</p>
{% if has_run %}
<h2>Latest run {{ run_id }}</h2>
<pre>{{ brief }}</pre>
{% else %}
<p>No sync run has completed yet.</p>
{% endif %}
</body>
</html>"#,
    ext = "html"
)]
struct StatusTemplate {
    running: bool,
    has_run: bool,
    run_id: String,
    brief: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_page_handler))
        .route("/healthz", get(healthz_handler))
        .route("/runs", post(trigger_run_handler))
        .route("/runs/latest", get(latest_run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<SyncPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web trigger listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

pub fn port_from_env() -> u16 {
    std::env::var("STAYSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

async fn status_page_handler(State(state): State<Arc<AppState>>) -> Response {
    let latest = state.pipeline.latest_summary().await;
    let tpl = StatusTemplate {
        running: state.pipeline.is_running(),
        has_run: latest.is_some(),
        run_id: latest
            .as_ref()
            .map(|s| s.run_id.to_string())
            .unwrap_or_default(),
        brief: latest.as_ref().map(render_brief).unwrap_or_default(),
    };
    render_html(tpl)
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "running": state.pipeline.is_running(),
    }))
    .into_response()
}

async fn trigger_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.try_run_once().await {
        None => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a sync run is already in progress" })),
        )
            .into_response(),
        Some(Ok(summary)) => Json(summary).into_response(),
        Some(Err(err)) => server_error(err),
    }
}

async fn latest_run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.latest_summary().await {
        Some(summary) => Json(summary).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no sync run has completed yet" })),
        )
            .into_response(),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    let message = format!("{err:#}");
    error!(error = %message, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use staysync_core::{Feed, Property};
    use staysync_feeds::StaticFeedRegistry;
    use staysync_storage::{FeedSource, FetchError, FetchedFeed, MemoryRecordStore};
    use staysync_sync::SyncConfig;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;
    use uuid::Uuid;

    const FEED_URL: &str = "https://calendar.example.test/p1.ics";
    const PAYLOAD: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:abc\r\nDTSTART;VALUE=DATE:20250701\r\nDTEND;VALUE=DATE:20250705\r\nSUMMARY:Reserved\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    /// Serves one fixed payload; when gated, each fetch waits for a release.
    struct GatedSource {
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl FeedSource for GatedSource {
        async fn fetch(&self, _run_id: Uuid, url: &str) -> Result<FetchedFeed, FetchError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(FetchedFeed {
                url: url.to_string(),
                final_url: url.to_string(),
                body: PAYLOAD.as_bytes().to_vec(),
                fetched_at: Utc::now(),
            })
        }
    }

    fn pipeline(gate: Option<Arc<Notify>>, workspace: &std::path::Path) -> Arc<SyncPipeline> {
        let registry = StaticFeedRegistry::new(vec![Property {
            property_id: "P1".into(),
            feeds: vec![Feed {
                url: FEED_URL.into(),
                platform: None,
                active: true,
                last_synced_at: None,
                consecutive_errors: 0,
            }],
        }])
        .unwrap();
        let mut config = SyncConfig::new(workspace, 14);
        config.reports_enabled = false;
        Arc::new(SyncPipeline::new(
            config,
            Arc::new(registry),
            Arc::new(GatedSource { gate }),
            Arc::new(MemoryRecordStore::new()),
        ))
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(AppState::new(pipeline(None, dir.path())))
            .oneshot(request("GET", "/healthz"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn latest_is_not_found_before_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(AppState::new(pipeline(None, dir.path())))
            .oneshot(request("GET", "/runs/latest"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn posting_a_run_returns_its_summary() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(AppState::new(pipeline(None, dir.path())));

        let resp = router.clone().oneshot(request("POST", "/runs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary = body_json(resp).await;
        assert_eq!(summary["created"], 1);
        assert_eq!(summary["feeds_succeeded"], 1);

        let latest = router.clone().oneshot(request("GET", "/runs/latest")).await.unwrap();
        assert_eq!(latest.status(), StatusCode::OK);
        assert_eq!(body_json(latest).await["run_id"], summary["run_id"]);

        let page = router.oneshot(request("GET", "/")).await.unwrap();
        assert_eq!(page.status(), StatusCode::OK);
        let html = page.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8(html.to_vec()).unwrap().contains("Staysync Run Brief"));
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let pipeline = pipeline(Some(gate.clone()), dir.path());
        let router = app(AppState::new(pipeline.clone()));

        let first = tokio::spawn(router.clone().oneshot(request("POST", "/runs")));
        for _ in 0..200 {
            if pipeline.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(pipeline.is_running());

        let second = router.oneshot(request("POST", "/runs")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status(), StatusCode::OK);
    }
}
