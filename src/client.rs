use crate::types::{
    AppendRequest, AppendResponse, ContinueRequest, ContinueResponse, HealthResponse,
    ProjectsResponse,
};
use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

pub const MAX_RETRIES: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Where captured content goes.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn health(&self) -> Result<HealthResponse>;
    async fn start_session(&self, request: &ContinueRequest) -> Result<ContinueResponse>;
    async fn append(&self, request: &AppendRequest) -> Result<AppendResponse>;
    /// Folder names already present in the store.
    async fn list_folders(&self) -> Result<Vec<String>>;
}

/// Talks to the append server over HTTP.
pub struct HttpChatSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChatSink {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ChatSink for HttpChatSink {
    async fn health(&self) -> Result<HealthResponse> {
        // Single attempt: the caller polls health on its own schedule.
        self.get_json("/api/health").await
    }

    async fn start_session(&self, request: &ContinueRequest) -> Result<ContinueResponse> {
        retry_operation("start session", RETRY_DELAY, || {
            self.post_json("/api/project/continue", request)
        })
        .await
    }

    async fn append(&self, request: &AppendRequest) -> Result<AppendResponse> {
        retry_operation("append", RETRY_DELAY, || {
            self.post_json("/api/project/append", request)
        })
        .await
    }

    async fn list_folders(&self) -> Result<Vec<String>> {
        let projects: ProjectsResponse =
            retry_operation("list projects", RETRY_DELAY, || self.get_json("/api/projects"))
                .await?;
        Ok(projects.projects.into_iter().map(|p| p.name).collect())
    }
}

/// A 4xx answer will not change on retry.
fn is_client_error(e: &eyre::Report) -> bool {
    e.downcast_ref::<reqwest::Error>()
        .and_then(reqwest::Error::status)
        .is_some_and(|s| s.is_client_error())
}

/// Run `operation` up to [`MAX_RETRIES`] times, waiting `delay * attempt`
/// between attempts. Client errors are returned at once.
pub async fn retry_operation<T, F, Fut>(context: &str, delay: Duration, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 1..=MAX_RETRIES {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if is_client_error(&e) => {
                return Err(e.wrap_err(format!("{context} rejected")));
            }
            Err(e) => {
                warn!("{context} failed (attempt {attempt}/{MAX_RETRIES}): {e:#}");
                last_error = Some(e);
                if attempt < MAX_RETRIES {
                    tokio::time::sleep(delay * attempt).await;
                }
            }
        }
    }
    error!("{context} failed after {MAX_RETRIES} attempts");
    Err(last_error
        .unwrap_or_else(|| eyre!("no attempts made"))
        .wrap_err(format!("{context} failed after {MAX_RETRIES} attempts")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serve `POST /api/project/append` answering `status`, counting hits.
    async fn append_server(status: StatusCode) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/api/project/append",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn request() -> AppendRequest {
        AppendRequest {
            session_id: None,
            project: "a/b".into(),
            chat_name: Some("chat".into()),
            new_content: "Human: hello there".into(),
        }
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let (url, hits) = append_server(StatusCode::BAD_REQUEST).await;
        let sink = HttpChatSink::new(url).unwrap();
        let err = sink.append(&request()).await.unwrap_err();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(format!("{err:#}").contains("rejected"));
    }

    #[tokio::test]
    async fn server_error_is_retried() {
        let (url, hits) = append_server(StatusCode::INTERNAL_SERVER_ERROR).await;
        let sink = HttpChatSink::new(url).unwrap();
        assert!(sink.append(&request()).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), MAX_RETRIES);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let value = retry_operation("flaky", Duration::from_millis(1000), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(eyre!("not yet"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_operation("down", Duration::from_millis(10), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(eyre!("connection refused"))
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRIES);
        assert!(format!("{err:#}").contains("connection refused"));
    }
}
