//! HTTP transport for the audit dashboard.
//!
//! A thin layer over [`AuditController`]: every handler validates input, calls one controller
//! operation, and maps the outcome onto `{status, message}` JSON.

use crate::error::StartError;
use crate::model::{resolve_controls, RunStatus};
use crate::orchestrator::AuditController;
use anyhow::{Context, Result};
use axum::async_trait;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiMessage {
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl ApiMessage {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".into(),
            message: message.into(),
            run_id: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            message: message.into(),
            run_id: None,
        }
    }
}

type ApiError = (StatusCode, Json<ApiMessage>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ApiMessage::error(message)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BrowserStatus {
    pub is_running: bool,
    pub is_analyzing: bool,
}

/// JSON start request. `benchmark` is a `{"controls": [...]}` document and `controls` a bare
/// list; either may be sent as JSON or as a JSON-encoded string.
#[derive(Debug, Deserialize)]
struct StartRequest {
    #[serde(default)]
    resource_name: Option<String>,
    #[serde(default)]
    benchmark: Option<Value>,
    #[serde(default)]
    controls: Option<Value>,
}

/// Start input, accepted either as JSON or as the dashboard's multipart form
/// (`benchmark_file` upload, `resource_name` and `controls` fields).
#[derive(Debug, Default)]
struct StartForm {
    resource_name: Option<String>,
    benchmark: Option<String>,
    controls: Option<String>,
}

#[async_trait]
impl<S: Send + Sync> FromRequest<S> for StartForm {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let multipart = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("multipart/form-data"));
        if multipart {
            let form = Multipart::from_request(req, state)
                .await
                .map_err(|e| bad_request(format!("Invalid form data: {e}")))?;
            return read_form(form).await;
        }

        let Json(body) = Json::<StartRequest>::from_request(req, state)
            .await
            .map_err(|e| bad_request(format!("Invalid request body: {e}")))?;
        Ok(StartForm {
            resource_name: body.resource_name,
            benchmark: document(body.benchmark),
            controls: document(body.controls),
        })
    }
}

async fn read_form(mut form: Multipart) -> Result<StartForm, ApiError> {
    let mut out = StartForm::default();
    while let Some(field) = form
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Invalid form data: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let text = field
            .text()
            .await
            .map_err(|e| bad_request(format!("Invalid form field {name}: {e}")))?;
        // Browsers send an empty part for an unselected file input.
        let value = Some(text).filter(|t| !t.trim().is_empty());
        match name.as_str() {
            "resource_name" => out.resource_name = value,
            "benchmark_file" | "benchmark" => out.benchmark = value,
            "controls" => out.controls = value,
            _ => {}
        }
    }
    Ok(out)
}

pub fn router(controller: AuditController) -> Router {
    Router::new()
        .route("/api/browser-status", get(browser_status))
        .route("/api/launch-browser", post(launch_browser))
        .route("/api/start-analysis", post(start_analysis))
        .route("/api/analysis-status", get(analysis_status))
        .route("/api/stop-analysis", post(stop_analysis))
        .layer(cors())
        .with_state(controller)
}

/// The dashboard is served from its own origin.
fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Serve until Ctrl-C.
pub async fn serve(controller: AuditController, listen: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    info!(addr = %listen, "audit API listening");
    run_server(controller, listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Serve until `shutdown` resolves, then stop any in-flight run and wait for it to write its
/// partial report before returning.
async fn run_server<F>(controller: AuditController, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let shutdown_ctl = controller.clone();
    let served = axum::serve(listener, router(controller.clone()))
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutdown requested");
            shutdown_ctl.stop();
        })
        .await
        .context("HTTP server failed");

    if controller.status().active {
        info!("waiting for the active run to finish its current control");
    }
    controller.shutdown().await;
    served
}

async fn browser_status(State(ctl): State<AuditController>) -> Json<BrowserStatus> {
    Json(BrowserStatus {
        is_running: ctl.session().is_established(),
        is_analyzing: ctl.status().active,
    })
}

async fn launch_browser(
    State(ctl): State<AuditController>,
) -> Result<Json<ApiMessage>, ApiError> {
    match ctl.session().launch().await {
        Ok(true) => Ok(Json(ApiMessage::success("Browser launched successfully"))),
        Ok(false) => Ok(Json(ApiMessage::success("Browser is already running"))),
        Err(e) => {
            error!(error = %format!("{e:#}"), "browser launch failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiMessage::error(format!("{e:#}"))),
            ))
        }
    }
}

async fn start_analysis(
    State(ctl): State<AuditController>,
    form: StartForm,
) -> Result<Json<ApiMessage>, ApiError> {
    let resource_name = form.resource_name.unwrap_or_default();
    info!(resource = %resource_name, "received start analysis request");
    let handle = resolve_controls(form.benchmark.as_deref(), form.controls.as_deref())
        .and_then(|controls| ctl.start(controls, &resource_name))
        .map_err(start_rejected)?;

    Ok(Json(ApiMessage {
        run_id: Some(handle.run_id().to_string()),
        ..ApiMessage::success("Analysis started")
    }))
}

async fn analysis_status(State(ctl): State<AuditController>) -> Json<RunStatus> {
    Json(ctl.status())
}

async fn stop_analysis(State(ctl): State<AuditController>) -> Json<ApiMessage> {
    ctl.stop();
    Json(ApiMessage::success("Stop signal sent"))
}

fn document(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn start_rejected(e: StartError) -> ApiError {
    let code = if e.is_conflict() {
        StatusCode::CONFLICT
    } else {
        StatusCode::BAD_REQUEST
    };
    (code, Json(ApiMessage::error(e.to_string())))
}
