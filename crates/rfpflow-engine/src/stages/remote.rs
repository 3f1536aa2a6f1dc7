use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::Client;
use tracing::{debug, warn};

use rfpflow_core::config::StageEndpointConfig;
use rfpflow_core::error::{Result, WorkflowError};
use rfpflow_core::state::{PartialUpdate, StageInput, WorkflowState};
use rfpflow_core::traits::StageAdapter;
use rfpflow_core::types::StageName;

/// Longest slice of an error body carried into a stage error.
const MAX_ERROR_BODY: usize = 200;

/// A stage implemented by an HTTP service.
///
/// POSTs the stage's `StageInput` as JSON and expects a `PartialUpdate` JSON
/// object back. Transport failures, non-2xx replies and malformed bodies
/// all become a stage error; `execute` never fails.
pub struct RemoteStage {
    stage: StageName,
    endpoint: String,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
    http: Client,
}

impl RemoteStage {
    pub fn new(stage: StageName, endpoint: impl Into<String>) -> Self {
        Self {
            stage,
            endpoint: endpoint.into(),
            api_key: None,
            timeout_secs: None,
            http: Client::new(),
        }
    }

    pub fn from_config(stage: StageName, config: &StageEndpointConfig) -> Self {
        let mut remote = Self::new(stage, config.endpoint.clone());
        if let Some(key) = &config.api_key {
            remote = remote.with_api_key(key.clone());
        }
        if let Some(secs) = config.timeout_secs {
            remote = remote.with_timeout_secs(secs);
        }
        remote
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, state: &WorkflowState) -> Result<PartialUpdate> {
        let input = StageInput::for_stage(self.stage, state);

        let mut req = self
            .http
            .post(&self.endpoint)
            .header("X-Run-Id", state.run_id.as_str())
            .json(&input);
        if let Some(api_key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req.send().await.map_err(|e| WorkflowError::StageExecution {
            stage: self.stage,
            message: e.to_string(),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(WorkflowError::StageExecution {
                stage: self.stage,
                message: format!("HTTP {}: {}", status, body),
            });
        }

        response
            .json::<PartialUpdate>()
            .await
            .map_err(|e| WorkflowError::StageExecution {
                stage: self.stage,
                message: format!("malformed stage response: {}", e),
            })
    }
}

impl StageAdapter for RemoteStage {
    fn execute(&self, state: Arc<WorkflowState>) -> BoxFuture<'_, PartialUpdate> {
        Box::pin(async move {
            debug!(stage = %self.stage, endpoint = %self.endpoint, run_id = %state.run_id, "Calling stage service");
            match self.call(&state).await {
                Ok(update) => update,
                Err(e) => {
                    warn!(stage = %self.stage, error = %e, "Stage service call failed");
                    match e {
                        WorkflowError::StageExecution { message, .. } => PartialUpdate::failed(message),
                        other => PartialUpdate::failed(other.to_string()),
                    }
                }
            }
        })
    }

    fn timeout_secs(&self) -> Option<u64> {
        self.timeout_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use rfpflow_core::types::{DocumentId, ProjectId, RunId};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/stage", addr)
    }

    fn state() -> Arc<WorkflowState> {
        let mut state = WorkflowState::new(
            RunId::from_str("7_3_abc"),
            ProjectId(7),
            DocumentId(3),
            "We need a CRM migration.",
        );
        state.summary = Some("CRM migration".into());
        Arc::new(state)
    }

    #[tokio::test]
    async fn test_remote_stage_posts_input_and_parses_update() {
        let app = Router::new().route(
            "/stage",
            post(|headers: HeaderMap, Json(input): Json<StageInput>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(serde_json::json!({
                    "value_propositions": [format!("{} via {}", input.rfp_summary, auth)]
                }))
            }),
        );
        let url = serve(app).await;

        let stage = RemoteStage::new(StageName::ValueProposition, url).with_api_key("sk-1");
        let update = stage.execute(state()).await;

        assert!(update.error.is_none());
        assert_eq!(
            update.value_propositions,
            Some(vec!["CRM migration via Bearer sk-1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_remote_stage_http_error_becomes_stage_error() {
        let app = Router::new().route(
            "/stage",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "model overloaded") }),
        );
        let url = serve(app).await;

        let update = RemoteStage::new(StageName::CaseStudyMatcher, url)
            .execute(state())
            .await;

        let error = update.error.unwrap();
        assert!(error.contains("503"));
        assert!(error.contains("model overloaded"));
        assert!(update.matched_cases.is_none());
    }

    #[tokio::test]
    async fn test_remote_stage_malformed_body() {
        let app = Router::new().route("/stage", post(|| async { "not json" }));
        let url = serve(app).await;

        let update = RemoteStage::new(StageName::RfpAnalyzer, url)
            .execute(state())
            .await;
        assert!(update.error.unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_remote_stage_unreachable() {
        let update = RemoteStage::new(StageName::RfpAnalyzer, "http://127.0.0.1:1/stage")
            .execute(state())
            .await;
        assert!(update.is_error());
    }

    #[test]
    fn test_from_config_carries_timeout() {
        let config = StageEndpointConfig {
            endpoint: "http://localhost:9000".into(),
            api_key: None,
            timeout_secs: Some(30),
        };
        let stage = RemoteStage::from_config(StageName::ProposalBuilder, &config);
        assert_eq!(stage.timeout_secs(), Some(30));
        assert_eq!(stage.endpoint(), "http://localhost:9000");

        let unbounded = RemoteStage::from_config(
            StageName::ProposalBuilder,
            &StageEndpointConfig {
                timeout_secs: None,
                ..config
            },
        );
        assert_eq!(unbounded.timeout_secs(), None);
    }
}
