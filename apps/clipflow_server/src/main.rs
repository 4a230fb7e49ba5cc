use axum::{
    extract::{Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clipflow_core::config::ServiceConfig;
use clipflow_core::types::{RenderOptions, Scene};
use clipflow_render::caps::{self, EncoderProfile};
use clipflow_render::error::RenderError;
use clipflow_render::jobs::{JobRegistry, JobState, CANCELLED_KIND};
use clipflow_render::{command, fetch, plan, probe, supervise};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    registry: JobRegistry,
    profile: EncoderProfile,
    config: Arc<ServiceConfig>,
    client: reqwest::Client,
    encode_slots: Arc<Semaphore>,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    design: Scene,
    options: Option<RenderOptions>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    progress: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Arc::new(ServiceConfig::from_env());
    let profile = caps::detect().await;
    info!(?profile, "encoder profile selected");

    tokio::fs::create_dir_all(&config.workdir).await?;

    let state = AppState {
        registry: JobRegistry::default(),
        profile,
        client: reqwest::Client::builder().build()?,
        encode_slots: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
        base_url: format!("http://127.0.0.1:{}", config.port),
        config: config.clone(),
    };

    let app = Router::new()
        .route("/render", post(submit_render))
        .route("/render/:id", get(get_status).delete(cancel_render))
        .route("/render/:id/output", get(get_output))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "renderer listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn submit_render(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, String)> {
    let mut scene = req.design;
    if let Some(options) = &req.options {
        scene.apply_options(options);
    }
    scene
        .validate()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let job = state.registry.create(&state.config.workdir).await;
    info!(job_id = %job.id, clips = scene.clips().count(), "render job accepted");

    let job_id = job.id;
    tokio::spawn(run_pipeline(state, job_id, scene));

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job_id.to_string(),
        }),
    ))
}

async fn get_status(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let id = parse_job_id(&id)?;
    let job = state
        .registry
        .get(id)
        .await
        .ok_or((StatusCode::NOT_FOUND, "unknown job".to_string()))?;

    Ok(Json(StatusResponse {
        status: job.state.as_str(),
        progress: job.progress,
        url: job
            .output_path
            .as_ref()
            .map(|_| format!("{}/render/{}/output", state.base_url, job.id)),
        error: job.error,
    }))
}

async fn get_output(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Response, (StatusCode, String)> {
    let id = parse_job_id(&id)?;
    let job = state
        .registry
        .get(id)
        .await
        .ok_or((StatusCode::NOT_FOUND, "unknown job".to_string()))?;

    if job.state != JobState::Completed {
        return Err((StatusCode::CONFLICT, "output not ready".to_string()));
    }
    let path = job
        .output_path
        .ok_or((StatusCode::CONFLICT, "output not ready".to_string()))?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let content_type = content_type_for(&path);
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

/// Cancel a job (and delete an already-terminal one). Idempotent: repeating
/// the request on a terminal or unknown-but-deleted job is not an error.
async fn cancel_render(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let id = parse_job_id(&id)?;
    let job = match state.registry.get(id).await {
        Some(job) => job,
        None => return Ok(StatusCode::NO_CONTENT),
    };

    if job.state.is_terminal() {
        state.registry.remove(id).await;
        let _ = tokio::fs::remove_dir_all(&job.workdir).await;
        return Ok(StatusCode::NO_CONTENT);
    }

    // A pending job has no process yet; fail it directly so the pipeline
    // driver stops before spawning one. A running job is killed by its
    // supervisor when the signal arrives.
    if job.state == JobState::Pending {
        state
            .registry
            .fail(id, CANCELLED_KIND, "cancelled by request")
            .await;
    }
    state.registry.cancel(id).await;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_job_id(raw: &str) -> Result<Uuid, (StatusCode, String)> {
    Uuid::parse_str(raw).map_err(|_| (StatusCode::BAD_REQUEST, "invalid job id".to_string()))
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Pipeline driver
// ---------------------------------------------------------------------------

async fn run_pipeline(state: AppState, job_id: Uuid, scene: Scene) {
    if let Err(err) = drive_job(&state, job_id, &scene).await {
        error!(%job_id, kind = err.kind(), %err, "render job failed");
        state.registry.fail_with(job_id, &err).await;
    }

    // The workspace is released on every exit path; only a completed job
    // keeps it, so its output can still be served.
    if let Some(job) = state.registry.get(job_id).await {
        if job.state != JobState::Completed {
            let _ = tokio::fs::remove_dir_all(&job.workdir).await;
        }
    }
}

async fn drive_job(state: &AppState, job_id: Uuid, scene: &Scene) -> Result<(), RenderError> {
    let job = state
        .registry
        .get(job_id)
        .await
        .ok_or_else(|| RenderError::Internal("job vanished before start".into()))?;

    let _permit = state
        .encode_slots
        .acquire()
        .await
        .map_err(|_| RenderError::Internal("encode slots closed".into()))?;

    // Cancelled while queued behind the concurrency limit.
    if state
        .registry
        .get(job_id)
        .await
        .map(|j| j.state.is_terminal())
        .unwrap_or(true)
    {
        return Ok(());
    }

    tokio::fs::create_dir_all(&job.workdir).await?;
    let assets_dir = job.workdir.join("assets");
    let mut assets = fetch::resolve(&state.client, scene, &assets_dir, &state.config).await?;

    // Visual clips need source dimensions for their effective size.
    for (_, clip) in scene.clips() {
        if !clip.is_visual() {
            continue;
        }
        if let Some(asset) = assets.get_mut(clip.src()) {
            if asset.info.is_none() {
                asset.info = Some(probe::probe_media(&asset.path).await?);
            }
        }
    }

    let plan = plan::compile(scene, &assets, &state.profile)?;
    let output_path = job.workdir.join(format!("output.{}", scene.format));
    let invocation = command::synthesize(&plan, &state.profile, &output_path);

    if !state
        .registry
        .transition(job_id, JobState::Pending, JobState::Running)
        .await
    {
        // Cancelled while preparing; nothing was spawned.
        return Ok(());
    }

    let encode_timeout = (state.config.encode_timeout_secs > 0)
        .then(|| Duration::from_secs(state.config.encode_timeout_secs));
    supervise::run(
        &invocation,
        job_id,
        &state.registry,
        plan.duration_ms,
        output_path,
        encode_timeout,
    )
    .await;

    Ok(())
}
