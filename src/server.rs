use crate::error::ServerError;
use crate::scheduler::RepeatingTask;
use crate::store::{self, ChatStore, UNTITLED_CHAT};
use crate::types::{
    AppendRequest, AppendResponse, ContinueRequest, ContinueResponse, HealthResponse,
    ProjectStats, ProjectsResponse, SearchRequest, SearchResponse, SizeReport,
};
use crate::utils::ServeConfig;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use eyre::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const DEFAULT_PORT: u16 = 3737;
pub const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

type AppState = Arc<ChatStore>;

pub fn router(store: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/project/continue", post(continue_project))
        .route("/api/project/append", post(append))
        .route("/api/projects", get(list_projects))
        .route("/api/search", post(search))
        .route("/api/project/{name}/stats", get(project_stats))
        .route("/api/check-sizes", get(check_sizes))
        .with_state(store)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Bind, serve until Ctrl-C, and evict stale cache entries in the background.
pub async fn serve(config: ServeConfig) -> Result<()> {
    let store = Arc::new(ChatStore::open(&config.base_dir)?);

    let evicting = store.clone();
    let mut cleanup = RepeatingTask::start(store::CLEANUP_INTERVAL, move || {
        let store = evicting.clone();
        async move {
            store.evict_stale(Instant::now());
        }
    });

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {addr}"))?;

    info!("server running at http://{}", addr);
    info!("save location: {}", store.base_dir().display());

    axum::serve(listener, router(store.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .wrap_err("Server failed")?;

    cleanup.stop().await?;
    info!(sessions = store.active_sessions(), "server stopped");
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, ServerError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await??)
}

fn check_project(project: &str) -> Result<(), ServerError> {
    store::validate_project_name(project).map_err(|e| ServerError::BadRequest(e.to_string()))
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(store): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: store.active_sessions(),
    })
}

async fn continue_project(
    State(store): State<AppState>,
    Json(request): Json<ContinueRequest>,
) -> Result<Json<ContinueResponse>, ServerError> {
    check_project(&request.project)?;
    info!(project = %request.project, chat = %request.chat_name, "session started");

    let total_words = blocking({
        let store = store.clone();
        let project = request.project.clone();
        move || {
            std::fs::create_dir_all(store.project_dir(&project)?)?;
            store.project_word_count(&project)
        }
    })
    .await?;
    store.register_session(&request.session_id, &request.chat_name);

    Ok(Json(ContinueResponse {
        success: true,
        project_file: format!("{}/", request.project),
        project: request.project,
        chat_name: request.chat_name,
        total_words,
    }))
}

async fn append(
    State(store): State<AppState>,
    Json(request): Json<AppendRequest>,
) -> Result<Json<AppendResponse>, ServerError> {
    check_project(&request.project)?;

    let chat = request
        .chat_name
        .filter(|c| !c.trim().is_empty())
        .or_else(|| {
            request
                .session_id
                .as_deref()
                .and_then(|id| store.session(id))
                .map(|s| s.chat_name)
        })
        .unwrap_or_else(|| UNTITLED_CHAT.to_string());

    let response = blocking({
        let store = store.clone();
        move || store.append(&request.project, Some(&chat), &request.new_content)
    })
    .await?;
    Ok(Json(response))
}

async fn list_projects(State(store): State<AppState>) -> Result<Json<ProjectsResponse>, ServerError> {
    let projects = blocking({
        let store = store.clone();
        move || store.list_projects()
    })
    .await?;
    Ok(Json(ProjectsResponse {
        total_projects: projects.len(),
        projects,
        active_sessions: store.active_sessions(),
    }))
}

async fn search(
    State(store): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ServerError> {
    let query = request.query;
    let results = blocking({
        let query = query.clone();
        move || store.search(&query)
    })
    .await?;
    Ok(Json(SearchResponse {
        total_matches: results.iter().map(|r| r.total_matches).sum(),
        query,
        results,
    }))
}

async fn project_stats(
    State(store): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProjectStats>, ServerError> {
    check_project(&name)?;
    let stats = blocking({
        let name = name.clone();
        move || store.project_stats(&name)
    })
    .await?;
    stats
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("Project not found: {name}")))
}

async fn check_sizes(State(store): State<AppState>) -> Result<Json<SizeReport>, ServerError> {
    Ok(Json(blocking(move || store.check_sizes()).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ChatStore::open(dir.path()).unwrap());
        (dir, router(store))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn health_reports_running() {
        let (_dir, app) = app();
        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["activeSessions"], 0);
    }

    #[tokio::test]
    async fn session_then_appends_accumulate_words() {
        let (_dir, app) = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/project/continue",
            Some(json!({"sessionId": "s1", "project": "Work", "chatName": "Lifetimes"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalWords"], 0);
        assert_eq!(body["projectFile"], "Work/");

        let (status, body) = call(
            &app,
            "POST",
            "/api/project/append",
            Some(json!({"sessionId": "s1", "project": "Work", "chatName": "Lifetimes", "newContent": "Human: what is 'a?\n"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["savedTo"].as_str().unwrap().ends_with("lifetimes.md"));

        // Missing chat name falls back to the session's chat.
        let (_, body) = call(
            &app,
            "POST",
            "/api/project/append",
            Some(json!({"sessionId": "s1", "project": "Work", "newContent": "Assistant: a lifetime\n"})),
        )
        .await;
        assert!(body["savedTo"].as_str().unwrap().ends_with("lifetimes.md"));

        let (_, health) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(health["activeSessions"], 1);
    }

    #[tokio::test]
    async fn blank_append_is_noop() {
        let (_dir, app) = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/project/append",
            Some(json!({"project": "Work", "chatName": "c", "newContent": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "No content to save");
    }

    #[tokio::test]
    async fn projects_search_and_stats() {
        let (_dir, app) = app();
        call(
            &app,
            "POST",
            "/api/project/append",
            Some(json!({"project": "Work", "chatName": "Serde", "newContent": "Human: serde rename_all\n"})),
        )
        .await;

        let (_, body) = call(&app, "GET", "/api/projects", None).await;
        assert_eq!(body["totalProjects"], 2);

        let (_, body) = call(&app, "POST", "/api/search", Some(json!({"query": "RENAME_ALL"}))).await;
        assert_eq!(body["totalMatches"], 1);
        assert_eq!(body["results"][0]["file"], "serde.md");

        let (status, body) = call(&app, "GET", "/api/project/Work/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chatCount"], 1);

        let (status, _) = call(&app, "GET", "/api/project/Missing/stats", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "GET", "/api/check-sizes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limits"]["limit"], 1_048_576);
    }

    #[tokio::test]
    async fn invalid_project_is_bad_request() {
        let (_dir, app) = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/project/append",
            Some(json!({"project": "..", "chatName": "c", "newContent": "text"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }
}
