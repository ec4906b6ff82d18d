use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use retro_jobs::JobPoll;
use retro_pipeline::{PipelineJob, UserRules};
use retro_rules::RuleSource;
use retro_types::archive::{self, ArchiveEntry};
use retro_types::outcome::{COMPOUNDS_ENTRY, PATHS_ENTRY};
use retro_types::{
    Endpoint, OutcomeStatus, PipelineResult, RequestParams, RetroError, RuleOutputFormat,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::upload::{Upload, PATHWAYS_PART, RULES_PART, SINK_PART};
use crate::{stamp as envelope, ApiError, AppState};

/// Response header that flags a partial result.
pub const STATUS_HEADER: &str = "status_message";

type ApiResult = Result<Response, ApiError>;

pub async fn stamp() -> Json<Value> {
    Json(envelope("running", json!({})))
}

pub async fn retrorules(State(state): State<AppState>, multipart: Multipart) -> ApiResult {
    let mut upload = Upload::read(multipart).await?;
    let resolved = RequestParams::resolve(&upload.data, Endpoint::Rules, upload.has_file(RULES_PART))?;
    let RequestParams::Rules(request) = resolved else {
        return Err(mismatch(Endpoint::Rules));
    };
    let source = match (upload.take_file(RULES_PART), request.input_format) {
        (Some(data), Some(format)) => RuleSource::Inline { data, format },
        _ => RuleSource::Builtin,
    };
    let selector = state.coordinator.selector().clone();
    let output = request.output_format;
    let bytes = tokio::task::spawn_blocking(move || {
        selector.select_bytes(&source, request.scope, &request.diameters, output)
    })
    .await
    .map_err(|e| ApiError::new(500, format!("rule selection task: {e}")))??;

    let (name, mime) = match output {
        RuleOutputFormat::Csv => ("Rules.csv", "text/csv"),
        RuleOutputFormat::Tar => ("Rules.tar.gz", "application/gzip"),
    };
    Ok(attachment(bytes, name, mime, None))
}

pub async fn retropath2(State(state): State<AppState>, multipart: Multipart) -> ApiResult {
    let mut upload = Upload::read(multipart).await?;
    let resolved = RequestParams::resolve(&upload.data, Endpoint::Expansion, upload.has_file(RULES_PART))?;
    let RequestParams::Expansion(request) = resolved else {
        return Err(mismatch(Endpoint::Expansion));
    };
    let rules = UserRules {
        data: upload.require_file(RULES_PART)?,
        format: request.rules_format,
    };
    let sink = upload.require_file(SINK_PART)?;

    let outcome = state
        .coordinator
        .run_expansion(&sink, &rules, &request.source, &request.params)
        .await?;
    let status = outcome.status;
    let diagnostic = outcome.diagnostic.clone();
    match outcome.into_payload() {
        Some(table) => {
            let flag = status.is_partial().then(|| status.as_str());
            Ok(attachment(table, "rp2_pathways.csv", "text/csv", flag))
        }
        None => Err(ApiError::tagged(status.http_status(), status.as_str(), diagnostic)),
    }
}

pub async fn rp2paths(State(state): State<AppState>, multipart: Multipart) -> ApiResult {
    let mut upload = Upload::read(multipart).await?;
    let RequestParams::Enumeration(params) =
        RequestParams::resolve(&upload.data, Endpoint::Enumeration, false)?
    else {
        return Err(mismatch(Endpoint::Enumeration));
    };
    let pathways = upload.require_file(PATHWAYS_PART)?;

    let outcome = state.coordinator.run_enumeration(&pathways, &params).await?;
    let status = outcome.status;
    let Some(payload) = outcome.payload() else {
        return Err(ApiError::tagged(
            status.http_status(),
            status.as_str(),
            outcome.diagnostic.clone(),
        ));
    };
    let bytes = archive::pack(&[
        ArchiveEntry::new(PATHS_ENTRY, &payload.paths),
        ArchiveEntry::new(COMPOUNDS_ENTRY, &payload.compounds),
    ])?;
    Ok(attachment(bytes, "rp2paths.tar.gz", "application/gzip", None))
}

pub async fn pipeline(State(state): State<AppState>, multipart: Multipart) -> ApiResult {
    let job = pipeline_job(Upload::read(multipart).await?)?;
    let result = state.coordinator.run(&job).await?;
    pipeline_response(result)
}

pub async fn submit_job(State(state): State<AppState>, multipart: Multipart) -> ApiResult {
    let job = pipeline_job(Upload::read(multipart).await?)?;
    let id = state.jobs.submit(job).await?;
    let body = envelope("queued", json!({ "job_id": id }));
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

pub async fn poll_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.jobs.poll(&id).await {
        JobPoll::NotFound => Err(RetroError::JobNotFound(id).into()),
        JobPoll::Found(snapshot) => {
            let status = snapshot.status.as_str();
            let data = serde_json::to_value(&snapshot).map_err(RetroError::from)?;
            Ok(Json(envelope(status, data)).into_response())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultQuery {
    /// Block until the job is terminal.
    #[serde(default)]
    pub wait: bool,
}

pub async fn job_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> ApiResult {
    if query.wait {
        state.jobs.wait(&id, state.poll_interval).await?;
    }
    let result = state.jobs.fetch(&id).await?;
    pipeline_response(result)
}

fn pipeline_job(mut upload: Upload) -> Result<PipelineJob, ApiError> {
    let resolved = RequestParams::resolve(&upload.data, Endpoint::Pipeline, upload.has_file(RULES_PART))?;
    let RequestParams::Pipeline(request) = resolved else {
        return Err(mismatch(Endpoint::Pipeline));
    };
    let sink = upload.require_file(SINK_PART)?;
    let rules = upload.take_file(RULES_PART);
    Ok(PipelineJob::new(request, sink, rules)?)
}

fn pipeline_response(result: PipelineResult) -> ApiResult {
    if !result.status.is_success() {
        let tag = result.status.to_string();
        return Err(ApiError::tagged(result.http_status(), tag, result.diagnostic));
    }
    let bytes = result.archive()?;
    let flag = result.partial_expansion.map(|s| s.as_str());
    Ok(attachment(bytes, "retrosynthesis.tar.gz", "application/gzip", flag))
}

fn attachment(bytes: Vec<u8>, name: &str, mime: &'static str, partial: Option<&str>) -> Response {
    let mut response = bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(tag) = partial.and_then(|t| HeaderValue::from_str(t).ok()) {
        headers.insert(STATUS_HEADER, tag);
    }
    response
}

fn mismatch(endpoint: Endpoint) -> ApiError {
    ApiError::new(500, format!("parameters resolved for the wrong entry point: {endpoint:?}"))
}
