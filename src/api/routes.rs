//! REST endpoints and router assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use super::error::ApiError;
use super::ws::{ConnectionHub, ws_handler};
use crate::config::{AnalysisConfig, WorkflowConfig};
use crate::llm::LlmProvider;
use crate::store::{Database, Directory};
use crate::workflow::types::{MessageContext, OrgUnit, Urgency, UserInfo};
use crate::workflow::{
    Analyzer, IntakeHandler, RecipientMatcher, StatusQuery, Submission, WorkflowEngine,
};

pub const SERVICE_NAME: &str = "houkokusou";

const ACCEPTED_MESSAGE: &str = "相談を受け付けました。分析中です。";

/// Identity headers set by the authenticating proxy.
const USER_ID_HEADER: &str = "x-user-id";
const USER_EMAIL_HEADER: &str = "x-user-email";
const USER_DEPARTMENT_HEADER: &str = "x-user-department";
const USER_ROLE_HEADER: &str = "x-user-role";
const USER_NAME_HEADER: &str = "x-user-name";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<IntakeHandler>,
    pub status: Arc<StatusQuery>,
    pub directory: Arc<dyn Directory>,
    pub hub: Arc<ConnectionHub>,
}

impl AppState {
    /// Wire the workflow components together. The hub doubles as the
    /// engine's notifier.
    pub fn assemble(
        llm: Arc<dyn LlmProvider>,
        db: Arc<dyn Database>,
        directory: Arc<dyn Directory>,
        analysis: AnalysisConfig,
        workflow: WorkflowConfig,
    ) -> Self {
        let hub = Arc::new(ConnectionHub::new(db.clone(), workflow.connection_ttl));
        let analyzer = Analyzer::new(llm, db.clone(), analysis);
        let matcher = RecipientMatcher::new(directory.clone(), workflow.fallback_recipient.clone());
        let engine = Arc::new(WorkflowEngine::new(
            db.clone(),
            analyzer,
            matcher,
            hub.clone(),
            workflow.clone(),
        ));

        Self {
            intake: Arc::new(IntakeHandler::new(db.clone(), engine, workflow)),
            status: Arc::new(StatusQuery::new(db)),
            directory,
            hub,
        }
    }
}

/// Build the Axum router with the REST API and the WebSocket channel.
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/v1/health", get(health))
        .route("/api/v1/chat", post(submit_chat))
        .route("/api/v1/chat/{conversation_id}", get(chat_status))
        .route("/api/v1/organizations", get(list_units))
        .route(
            "/api/v1/organizations/{unit_id}",
            put(upsert_unit).delete(delete_unit),
        )
        .with_state(state);

    if let Some(cors) = cors_layer(allowed_origins) {
        app = app.layer(cors);
    }
    app.layer(TraceLayer::new_for_http())
}

/// `None` when no origins are configured, i.e. same-origin only.
fn cors_layer(allowed_origins: &[String]) -> Option<CorsLayer> {
    if allowed_origins.is_empty() {
        return None;
    }

    let origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %o, "Ignoring unparsable CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                HeaderName::from_static(USER_ID_HEADER),
                HeaderName::from_static(USER_EMAIL_HEADER),
                HeaderName::from_static(USER_DEPARTMENT_HEADER),
                HeaderName::from_static(USER_ROLE_HEADER),
                HeaderName::from_static(USER_NAME_HEADER),
            ])
            .max_age(Duration::from_secs(3600)),
    )
}

/// Caller identity from the proxy headers. No `x-user-id` means anonymous.
///
/// Values are read as UTF-8 so Japanese names and departments survive.
pub(crate) fn user_from_headers(headers: &HeaderMap) -> UserInfo {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| std::str::from_utf8(v.as_bytes()).ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    let mut user = UserInfo::anonymous();
    let user_id = read(USER_ID_HEADER);
    if !user_id.is_empty() {
        user.user_id = user_id;
    }
    user.email = read(USER_EMAIL_HEADER);
    user.department = read(USER_DEPARTMENT_HEADER);
    user.role = read(USER_ROLE_HEADER);
    user.name = read(USER_NAME_HEADER);
    user
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
    }))
}

// ── Chat ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    context: Option<MessageContext>,
    #[serde(default)]
    connection_id: Option<String>,
}

async fn submit_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let submission = Submission {
        message: req.message,
        context: req.context.unwrap_or_default(),
        user: user_from_headers(&headers),
        connection_id: req.connection_id.filter(|id| !id.trim().is_empty()),
    };
    let accepted = state.intake.submit(submission).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "conversationId": accepted.conversation_id,
            "status": accepted.status,
            "message": ACCEPTED_MESSAGE,
            "executionId": accepted.execution_id,
        })),
    ))
}

async fn chat_status(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.status.status(&conversation_id).await?;
    Ok(Json(report))
}

// ── Organization directory ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnitRequest {
    #[serde(default = "default_organization")]
    organization_id: String,
    #[serde(default)]
    department_id: String,
    #[serde(default)]
    department_name: String,
    #[serde(default)]
    recipient: String,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    min_urgency: Urgency,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    contact: Option<String>,
}

fn default_organization() -> String {
    "default".to_string()
}

impl UnitRequest {
    fn into_unit(self, id: String) -> Result<OrgUnit, ApiError> {
        if self.recipient.trim().is_empty() {
            return Err(ApiError::bad_request("recipient is required"));
        }
        if self.department_name.trim().is_empty() {
            return Err(ApiError::bad_request("departmentName is required"));
        }
        let department_id = if self.department_id.trim().is_empty() {
            id.clone()
        } else {
            self.department_id
        };
        Ok(OrgUnit {
            id,
            organization_id: self.organization_id,
            department_id,
            department_name: self.department_name.trim().to_string(),
            recipient: self.recipient.trim().to_string(),
            categories: self
                .categories
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            min_urgency: self.min_urgency,
            priority: self.priority,
            contact: self.contact.filter(|c| !c.trim().is_empty()),
        })
    }
}

async fn list_units(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let units = state.directory.list_units().await?;
    Ok(Json(units))
}

async fn upsert_unit(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
    body: Result<Json<UnitRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let unit = req.into_unit(unit_id)?;
    state.directory.upsert_unit(&unit).await?;
    info!(unit_id = %unit.id, recipient = %unit.recipient, "Directory unit saved");
    Ok(Json(unit))
}

async fn delete_unit(
    State(state): State<AppState>,
    Path(unit_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.directory.delete_unit(&unit_id).await? {
        info!(unit_id = %unit_id, "Directory unit deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(crate::error::WorkflowError::NotFound(unit_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_identity_is_anonymous() {
        let user = user_from_headers(&HeaderMap::new());
        assert!(user.is_anonymous());
        assert!(user.department.is_empty());
    }

    #[test]
    fn identity_headers_are_read_as_utf8() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u-42"));
        headers.insert(
            USER_DEPARTMENT_HEADER,
            HeaderValue::from_bytes("営業部".as_bytes()).unwrap(),
        );
        headers.insert(USER_ROLE_HEADER, HeaderValue::from_static(" manager "));

        let user = user_from_headers(&headers);
        assert_eq!(user.user_id, "u-42");
        assert_eq!(user.department, "営業部");
        assert_eq!(user.role, "manager");
    }

    #[test]
    fn blank_user_id_stays_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("   "));
        assert!(user_from_headers(&headers).is_anonymous());
    }

    #[test]
    fn unit_request_requires_recipient_and_department() {
        let req: UnitRequest = serde_json::from_str(r#"{"departmentName":"人事部"}"#).unwrap();
        assert!(req.into_unit("hr".into()).is_err());

        let req: UnitRequest = serde_json::from_str(r#"{"recipient":"人事部"}"#).unwrap();
        assert!(req.into_unit("hr".into()).is_err());
    }

    #[test]
    fn unit_request_defaults() {
        let req: UnitRequest = serde_json::from_str(
            r#"{"departmentName":"総務部","recipient":"総務課長","categories":[" 業務相談 ",""]}"#,
        )
        .unwrap();
        let unit = req.into_unit("ga".into()).unwrap();
        assert_eq!(unit.id, "ga");
        assert_eq!(unit.department_id, "ga");
        assert_eq!(unit.organization_id, "default");
        assert_eq!(unit.categories, vec!["業務相談".to_string()]);
        assert_eq!(unit.min_urgency, Urgency::Low);
        assert!(unit.contact.is_none());
    }

    #[test]
    fn cors_is_off_without_origins() {
        assert!(cors_layer(&[]).is_none());
        assert!(cors_layer(&["http://localhost:8100".to_string()]).is_some());
        assert!(cors_layer(&["*".to_string()]).is_some());
    }

    // ── Router ──────────────────────────────────────────────────────────

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::error::LlmError;
    use crate::llm::provider::{CompletionRequest, CompletionResponse};
    use crate::store::LibSqlBackend;

    struct UnusedLlm;

    #[async_trait]
    impl LlmProvider for UnusedLlm {
        fn model_name(&self) -> &str {
            "unused"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::AuthFailed {
                provider: "unused".into(),
            })
        }
    }

    const ORIGIN: &str = "http://localhost:8100";

    async fn app() -> Router {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let state = AppState::assemble(
            Arc::new(UnusedLlm),
            db.clone(),
            db,
            AnalysisConfig::default(),
            WorkflowConfig::default(),
        );
        router(state, &[ORIGIN.to_string()])
    }

    #[tokio::test]
    async fn health_responds() {
        let resp = app()
            .await
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], SERVICE_NAME);
    }

    #[tokio::test]
    async fn preflight_allows_configured_origin() {
        let resp = app()
            .await
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/v1/chat")
                    .header(header::ORIGIN, ORIGIN)
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            ORIGIN
        );
    }

    #[tokio::test]
    async fn foreign_origin_gets_no_cors_header() {
        let resp = app()
            .await
            .oneshot(
                Request::get("/api/v1/health")
                    .header(header::ORIGIN, "https://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let resp = app()
            .await
            .oneshot(Request::get("/api/v2/chat").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
