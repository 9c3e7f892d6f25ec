//! REST status source for the polling fallback.

use std::time::Duration;

use async_trait::async_trait;
use tw_common::config::ApiConfig;
use tw_common::FetchError;
use tw_protocol::{TaskId, TaskStatusReport};
use url::Url;

use crate::poller::StatusSource;

/// Fetches `GET {base_url}/tasks/{id}`.
#[derive(Debug, Clone)]
pub struct HttpStatusSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Url::parse(&base_url)?;
        Ok(Self { client, base_url })
    }

    pub fn from_config(cfg: &ApiConfig) -> Result<Self, FetchError> {
        Self::new(
            cfg.base_url.clone(),
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }

    fn task_url(&self, task_id: TaskId) -> Result<Url, FetchError> {
        Ok(Url::parse(&format!("{}/tasks/{}", self.base_url, task_id))?)
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch_status(&self, task_id: TaskId) -> Result<TaskStatusReport, FetchError> {
        let url = self.task_url(task_id)?;
        tracing::trace!(task_id, %url, "Fetching task status");

        let resp = self.client.get(url).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status { status, body });
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(FetchError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_protocol::TaskStatus;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn source(server: &MockServer) -> HttpStatusSource {
        HttpStatusSource::new(format!("{}/api/v1/", server.uri()), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_decodes_report() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/tasks/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "completed",
                "progress": 100.0,
                "result_ref": "results/42.nc",
                "created_at": "2024-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let report = source(&server).await.fetch_status(42).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.progress, 100.0);
        assert_eq!(report.result_ref.as_deref(), Some("results/42.nc"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/tasks/7"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Task not found"))
            .mount(&server)
            .await;

        let err = source(&server).await.fetch_status(7).await.unwrap_err();
        match err {
            FetchError::Status { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "Task not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_undecodable_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/tasks/8"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = source(&server).await.fetch_status(8).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        let err = HttpStatusSource::new("not a url", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, FetchError::Url(_)));
    }
}
