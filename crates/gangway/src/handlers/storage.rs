use std::io;
use std::sync::Arc;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Multipart, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

use crate::auth::{OptionalAuth, RequireAuth};
use crate::blob_store::{StoreError, with_deadline};
use crate::error::{ApiError, ApiResult};
use crate::handlers::ApiState;
use crate::namespaces;
use crate::progress::{Direction, ProgressReporter};
use crate::transfer::{ChannelWriter, CountingReader, ProgressBody, sanitize_filename};

#[derive(Debug, Serialize)]
pub struct NamespaceSummary {
    pub name: String,
    pub count: usize,
    pub hidden: bool,
}

#[derive(Debug, Serialize)]
pub struct NamespaceResponse {
    pub name: String,
    pub hidden: bool,
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub namespace: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub name: String,
}

/// Resolve the request's namespace parameter: validate the name, require
/// the registry row to exist, and require a session when it is hidden.
fn resolve_visible_namespace(
    state: &ApiState,
    param: Option<&str>,
    authenticated: bool,
) -> ApiResult<String> {
    let name = namespaces::resolve_namespace(param).to_string();
    namespaces::validate_namespace_name(&name)?;
    let ns = state
        .repo
        .get_namespace(&name)?
        .ok_or_else(|| ApiError::NotFound(format!("namespace not found: {name}")))?;
    if ns.hidden && !authenticated {
        return Err(ApiError::Unauthenticated(
            "authentication required for hidden namespace".to_string(),
        ));
    }
    Ok(ns.name)
}

// ===== Namespace endpoints =====

/// GET /storage/namespaces — list namespaces with live blob counts.
/// Hidden namespaces are omitted for anonymous callers.
pub async fn list_namespaces(
    State(state): State<ApiState>,
    OptionalAuth(auth): OptionalAuth,
) -> ApiResult<Json<Vec<NamespaceSummary>>> {
    let rows = state.repo.list_namespaces(auth.is_some())?;
    let mut summaries = Vec::with_capacity(rows.len());
    for ns in rows {
        // Counts come from the backend at call time; nothing is cached.
        let blobs = with_deadline(
            state.config.meta_timeout(),
            state.store.list_blobs(&ns.name, ""),
        )
        .await?;
        summaries.push(NamespaceSummary {
            name: ns.name,
            count: blobs.len(),
            hidden: ns.hidden,
        });
    }
    Ok(Json(summaries))
}

#[derive(Debug, Deserialize)]
pub struct CreateNamespaceRequest {
    pub name: String,
    #[serde(default)]
    pub hidden: bool,
}

/// POST /storage/namespaces — create a namespace. Duplicates are a conflict
/// and never alter the existing row.
pub async fn create_namespace(
    State(state): State<ApiState>,
    RequireAuth(_auth): RequireAuth,
    Json(body): Json<CreateNamespaceRequest>,
) -> ApiResult<Json<NamespaceResponse>> {
    namespaces::validate_namespace_name(&body.name)?;
    if body.name == namespaces::HIDDEN_NAMESPACE && !body.hidden {
        return Err(ApiError::InvalidInput(format!(
            "namespace {} must be hidden",
            namespaces::HIDDEN_NAMESPACE
        )));
    }
    if let Err(err) = state.repo.create_namespace(&body.name, body.hidden) {
        if err.to_string().contains("UNIQUE constraint") {
            return Err(ApiError::Conflict(format!(
                "namespace already exists: {}",
                body.name
            )));
        }
        return Err(err.into());
    }
    tracing::info!(namespace = %body.name, hidden = body.hidden, "namespace created");
    Ok(Json(NamespaceResponse {
        name: body.name,
        hidden: body.hidden,
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateNamespaceRequest {
    pub name: String,
    pub hidden: bool,
}

/// PATCH /storage/namespaces — update the hidden flag. The reserved hidden
/// namespace can never be made visible; re-hiding it is a no-op success.
pub async fn update_namespace(
    State(state): State<ApiState>,
    RequireAuth(_auth): RequireAuth,
    Json(body): Json<UpdateNamespaceRequest>,
) -> ApiResult<Json<NamespaceResponse>> {
    namespaces::validate_namespace_name(&body.name)?;
    if body.name == namespaces::HIDDEN_NAMESPACE {
        if !body.hidden {
            return Err(ApiError::InvalidInput(format!(
                "namespace {} cannot be made visible",
                namespaces::HIDDEN_NAMESPACE
            )));
        }
        return Ok(Json(NamespaceResponse {
            name: body.name,
            hidden: true,
        }));
    }
    let updated = state.repo.set_namespace_hidden(&body.name, body.hidden)?;
    if !updated {
        return Err(ApiError::NotFound(format!(
            "namespace not found: {}",
            body.name
        )));
    }
    Ok(Json(NamespaceResponse {
        name: body.name,
        hidden: body.hidden,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteNamespaceRequest {
    pub name: String,
}

/// DELETE /storage/namespaces — purge every blob under the namespace, then
/// drop the registry row.
///
/// The registry delete goes last: a failure partway through the purge keeps
/// the row so the whole call can be retried, and per-blob deletes are
/// idempotent in the backend.
pub async fn delete_namespace(
    State(state): State<ApiState>,
    RequireAuth(_auth): RequireAuth,
    Json(body): Json<DeleteNamespaceRequest>,
) -> ApiResult<Json<StatusResponse>> {
    namespaces::validate_namespace_name(&body.name)?;
    if namespaces::is_reserved(&body.name) {
        return Err(ApiError::InvalidInput(format!(
            "namespace {} cannot be deleted",
            body.name
        )));
    }
    let ns = state
        .repo
        .get_namespace(&body.name)?
        .ok_or_else(|| ApiError::NotFound(format!("namespace not found: {}", body.name)))?;

    let blobs = with_deadline(
        state.config.meta_timeout(),
        state.store.list_blobs(&ns.name, ""),
    )
    .await?;
    for blob in &blobs {
        with_deadline(
            state.config.meta_timeout(),
            state.store.delete_blob(&ns.name, &blob.name),
        )
        .await?;
    }
    state.repo.delete_namespace(&ns.name)?;
    tracing::info!(namespace = %ns.name, blobs = blobs.len(), "namespace deleted");
    Ok(Json(StatusResponse {
        status: "deleted",
        name: ns.name,
    }))
}

// ===== File endpoints =====

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub namespace: Option<String>,
}

/// GET /storage/files — list blobs in a namespace.
pub async fn list_files(
    State(state): State<ApiState>,
    OptionalAuth(auth): OptionalAuth,
    Query(query): Query<ListFilesQuery>,
) -> ApiResult<Json<Vec<FileEntry>>> {
    let ns = resolve_visible_namespace(&state, query.namespace.as_deref(), auth.is_some())?;
    let blobs = with_deadline(state.config.meta_timeout(), state.store.list_blobs(&ns, "")).await?;
    let files = blobs
        .into_iter()
        .map(|blob| FileEntry {
            name: blob.name,
            path: blob.path,
            namespace: ns.clone(),
            size: blob.size,
            created_at: blob.created_at,
            modified_at: blob.modified_at,
        })
        .collect();
    Ok(Json(files))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub id: Option<String>,
    pub namespace: Option<String>,
}

/// POST /storage/upload — stream a multipart upload into the backend.
///
/// The first part named `file` carries the payload. When `X-File-Size` is
/// present the backend drives progress from bytes it has actually committed;
/// otherwise progress counts bytes read off the wire.
pub async fn upload(
    State(state): State<ApiState>,
    RequireAuth(_auth): RequireAuth,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<StatusResponse>> {
    let field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => break field,
            Ok(Some(_)) => continue,
            Ok(None) => {
                return Err(ApiError::InvalidInput(
                    "multipart field 'file' is missing".to_string(),
                ));
            }
            Err(err) => {
                return Err(ApiError::InvalidInput(format!(
                    "invalid multipart body: {err}"
                )));
            }
        }
    };

    let raw_name = field.file_name().map(|s| s.to_string()).ok_or_else(|| {
        ApiError::InvalidInput("multipart field 'file' has no filename".to_string())
    })?;
    let name = sanitize_filename(&raw_name)?;
    let ns = resolve_visible_namespace(&state, query.namespace.as_deref(), true)?;

    let declared_size = headers
        .get("x-file-size")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if let Some(total) = declared_size
        && total > state.config.max_upload_bytes
    {
        return Err(ApiError::InvalidInput(format!(
            "declared size {total} exceeds maximum of {} bytes",
            state.config.max_upload_bytes
        )));
    }

    // Overwrite is not supported; probe for an existing blob first.
    match with_deadline(state.config.meta_timeout(), state.store.stat_blob(&ns, &name)).await {
        Ok(_) => return Err(ApiError::Conflict(format!("file already exists: {name}"))),
        Err(StoreError::NotFound) => {}
        Err(err) => return Err(err.into()),
    }

    let reporter = ProgressReporter::new(
        Arc::clone(&state.hub),
        query.id.clone(),
        Direction::Upload,
        declared_size,
    );
    let body_reader = StreamReader::new(field.map_err(io::Error::other));

    let result = with_deadline(state.config.upload_timeout(), async {
        match declared_size {
            Some(total) => {
                let mut upload = state.store.prepare_sized_upload(&ns, &name, total).await?;
                let commit_reporter = reporter.clone();
                upload.on_progress(Box::new(move |bytes| commit_reporter.tick(bytes)));
                let mut reader =
                    CountingReader::new(body_reader, None, Some(state.config.max_upload_bytes));
                upload.append_from(&mut reader).await
            }
            None => {
                state.store.create_blob(&ns, &name).await?;
                let mut reader = CountingReader::new(
                    body_reader,
                    Some(reporter.clone()),
                    Some(state.config.max_upload_bytes),
                );
                state.store.append_from(&ns, &name, &mut reader).await
            }
        }
    })
    .await;

    match result {
        Ok(written) => {
            if let Some(total) = declared_size
                && written != total
            {
                tracing::warn!(
                    namespace = %ns,
                    file = %name,
                    declared = total,
                    written,
                    "upload size differs from declared size"
                );
            }
            reporter.finish();
            tracing::info!(namespace = %ns, file = %name, bytes = written, "upload complete");
            Ok(Json(StatusResponse {
                status: "uploaded",
                name,
            }))
        }
        Err(err) => {
            let api_err: ApiError = err.into();
            // The progress channel mirrors the HTTP failure so a watching UI
            // never hangs on a dead transfer.
            reporter.fail(&api_err.to_string());
            Err(api_err)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub name: String,
    pub id: Option<String>,
    pub namespace: Option<String>,
}

/// GET /storage/download — stream a blob as an attachment.
///
/// Visible namespaces are world-readable; hidden ones require a session.
/// A mid-stream backend failure aborts the response body and pushes a
/// terminal progress event instead, since flushed bytes cannot be recalled.
pub async fn download(
    State(state): State<ApiState>,
    OptionalAuth(auth): OptionalAuth,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let name = sanitize_filename(&query.name)?;
    let ns = resolve_visible_namespace(&state, query.namespace.as_deref(), auth.is_some())?;

    // Probe for the byte size. Missing files fail cleanly here before any
    // response bytes are committed; other probe failures are not fatal and
    // only cost the progress total.
    let size = match with_deadline(state.config.meta_timeout(), state.store.stat_blob(&ns, &name))
        .await
    {
        Ok(stat) => Some(stat.size),
        Err(StoreError::NotFound) => {
            return Err(ApiError::NotFound(format!("file not found: {name}")));
        }
        Err(err) => {
            tracing::warn!(namespace = %ns, file = %name, error = %err, "size probe failed");
            None
        }
    };

    let reporter = ProgressReporter::new(
        Arc::clone(&state.hub),
        query.id.clone(),
        Direction::Download,
        size,
    );

    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(8);
    let store = Arc::clone(&state.store);
    let deadline = state.config.download_timeout(size);
    let task_reporter = reporter.clone();
    let task_ns = ns.clone();
    let task_name = name.clone();
    tokio::spawn(async move {
        let mut writer = ChannelWriter::new(tx.clone());
        let result = with_deadline(
            deadline,
            store.read_into(&task_ns, &task_name, &mut writer),
        )
        .await;
        if let Err(err) = result {
            let message = err.to_string();
            tracing::warn!(
                namespace = %task_ns,
                file = %task_name,
                error = %message,
                "download failed"
            );
            task_reporter.fail(&message);
            let _ = tx.send(Err(io::Error::other(message))).await;
        }
    });

    let body = Body::from_stream(ProgressBody::new(rx, reporter));
    let content_type = mime_guess::from_path(&name).first_or_octet_stream();
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type.as_ref())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        );
    if let Some(size) = size {
        builder = builder.header(header::CONTENT_LENGTH, size);
    }
    builder
        .body(body)
        .map_err(|err| ApiError::Internal(format!("failed to build response: {err}")))
}

#[derive(Debug, Deserialize)]
pub struct DeleteFileQuery {
    pub name: String,
    pub namespace: Option<String>,
}

/// DELETE /storage/delete — remove a single blob. No progress reporting;
/// the operation is not byte-streamed.
pub async fn delete_file(
    State(state): State<ApiState>,
    RequireAuth(_auth): RequireAuth,
    Query(query): Query<DeleteFileQuery>,
) -> ApiResult<Json<StatusResponse>> {
    let name = sanitize_filename(&query.name)?;
    let ns = resolve_visible_namespace(&state, query.namespace.as_deref(), true)?;
    with_deadline(
        state.config.meta_timeout(),
        state.store.delete_blob(&ns, &name),
    )
    .await?;
    tracing::info!(namespace = %ns, file = %name, "file deleted");
    Ok(Json(StatusResponse {
        status: "deleted",
        name,
    }))
}
