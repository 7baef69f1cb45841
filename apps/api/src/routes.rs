use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use btb_citation::{
    audit::{AuditTarget, AuditValidator},
    extract::{ExtractorRegistry, ServiceExtractor},
    highlight::{render_document, DocumentView},
    ingest::{ingest_file, ingest_files, IngestFailure},
    resolver::{reference_at, resolve, resolve_bracket, segment_message, MessageSegment},
    session::{validate_query, ChatSession, ChatTurn, SubmissionSlot, Workspace},
};
use btb_core::{
    AuditLogEntry, Citation, DocumentSummary, Message, ProjectMetadata, UploadedFile,
    ValidationResult,
};
use btb_error::{BtbError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::store::MetadataStore;

/// 单次请求最多携带的文件数，用于推导请求体上限
const MAX_FILES_PER_REQUEST: usize = 16;

#[derive(Clone)]
pub struct AppState {
    pub workspace: Arc<RwLock<Workspace>>,
    pub chat: Arc<ChatSession>,
    pub auditor: Arc<AuditValidator>,
    pub extractors: Arc<ExtractorRegistry>,
    pub extract_service: Option<Arc<ServiceExtractor>>,
    pub store: Arc<dyn MetadataStore>,
    pub chat_slot: Arc<SubmissionSlot>,
    pub audit_slot: Arc<SubmissionSlot>,
    pub max_upload_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state
        .max_upload_bytes
        .saturating_mul(MAX_FILES_PER_REQUEST);
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/project", get(get_project).put(put_project))
        .route("/api/v1/documents", get(list_documents).post(upload_documents))
        .route("/api/v1/documents/:name", delete(remove_document))
        .route("/api/v1/documents/:name/view", get(view_document))
        .route("/api/v1/messages", get(list_messages))
        .route("/api/v1/messages/segments", post(message_segments))
        .route("/api/v1/chat", post(chat))
        .route("/api/v1/audit", post(audit))
        .route("/api/v1/logs", get(list_logs))
        .route("/api/v1/resolve", post(resolve_citation))
        .route("/api/v1/resolve/bracket", post(resolve_bracket_reference))
        .route("/api/v1/extract/health", get(extract_health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ===== 项目 =====

async fn get_project(State(state): State<AppState>) -> Json<ProjectMetadata> {
    Json(state.workspace.read().await.project.metadata.clone())
}

async fn put_project(
    State(state): State<AppState>,
    Json(metadata): Json<ProjectMetadata>,
) -> Result<Json<ProjectMetadata>> {
    state.store.save(&metadata)?;
    state.workspace.write().await.project.metadata = metadata.clone();
    info!(project = %metadata.name, "project metadata updated");
    Ok(Json(metadata))
}

// ===== 文档 =====

async fn list_documents(State(state): State<AppState>) -> Json<Vec<DocumentSummary>> {
    let ws = state.workspace.read().await;
    Json(ws.project.documents().iter().map(|d| d.summary()).collect())
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> BtbError {
    BtbError::InvalidRequest {
        reason: format!("invalid multipart body: {}", e),
    }
}

/// 读取 multipart 中的文件字段和文本字段
async fn read_multipart(mut multipart: Multipart) -> Result<(Vec<UploadedFile>, Option<String>)> {
    let mut files = Vec::new();
    let mut text = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(|s| s.to_string()).unwrap_or_default();
        match name.as_str() {
            "file" | "files" => {
                let file_name = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "upload.bin".into());
                let mime_type = field.content_type().map(|s| s.to_string()).unwrap_or_default();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                files.push(UploadedFile::new(file_name, mime_type, bytes.to_vec()));
            }
            "text" => {
                text = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }
    Ok((files, text))
}

#[derive(Serialize)]
struct UploadResponse {
    documents: Vec<DocumentSummary>,
    failures: Vec<IngestFailure>,
}

async fn upload_documents(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    let (files, _) = read_multipart(multipart).await?;
    if files.is_empty() {
        return Err(BtbError::InvalidRequest {
            reason: "no file fields in upload".to_string(),
        });
    }
    // 抽取在锁外完成
    let report = ingest_files(files, &state.extractors, state.max_upload_bytes).await;
    let documents = report.documents.iter().map(|d| d.summary()).collect();
    state
        .workspace
        .write()
        .await
        .project
        .add_documents(report.documents);
    Ok(Json(UploadResponse {
        documents,
        failures: report.failures,
    }))
}

async fn remove_document(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DocumentSummary>> {
    let removed = state.workspace.write().await.project.remove_document(&name);
    removed
        .map(|d| Json(d.summary()))
        .ok_or(BtbError::NotFound {
            resource: format!("document {}", name),
        })
}

#[derive(Deserialize)]
struct ViewQuery {
    #[serde(default)]
    term: String,
}

async fn view_document(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<ViewQuery>,
) -> Result<Json<DocumentView>> {
    let ws = state.workspace.read().await;
    let doc = ws.project.document(&name).ok_or(BtbError::NotFound {
        resource: format!("document {}", name),
    })?;
    Ok(Json(render_document(doc, &q.term)))
}

// ===== 对话 =====

async fn list_messages(State(state): State<AppState>) -> Json<Vec<Message>> {
    Json(state.workspace.read().await.messages().to_vec())
}

#[derive(Deserialize)]
struct ChatReq {
    query: String,
}

/// 模型调用放在独立任务里执行，客户端断开也会把这一轮写完并替换加载消息
async fn chat(State(state): State<AppState>, Json(req): Json<ChatReq>) -> Result<Json<Message>> {
    let slot = state.chat_slot.clone().try_acquire_owned()?;

    let project = {
        let mut ws = state.workspace.write().await;
        validate_query(&ws.project, &req.query)?;
        ws.begin_chat(&req.query);
        ws.project.clone()
    };

    let task = tokio::spawn(async move {
        let _slot = slot;
        let (turn, reply) = match state.chat.ask(&project, &req.query).await {
            Ok(turn) => {
                let reply = turn.reply.clone();
                (turn, Ok(reply))
            }
            // 已通过校验，这里只可能是意外错误
            Err(e) => (
                ChatTurn {
                    reply: Message::assistant(e.user_message(), Vec::new()),
                    log_entry: None,
                },
                Err(e),
            ),
        };
        state.workspace.write().await.complete_chat(turn);
        reply
    });
    Ok(Json(task.await??))
}

#[derive(Deserialize)]
struct SegmentsReq {
    content: String,
}

async fn message_segments(
    State(state): State<AppState>,
    Json(req): Json<SegmentsReq>,
) -> Json<Vec<MessageSegment>> {
    let ws = state.workspace.read().await;
    Json(segment_message(&req.content, ws.project.documents()))
}

// ===== 审计 =====

async fn audit(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ValidationResult>> {
    let slot = state.audit_slot.clone().try_acquire_owned()?;
    let (mut files, text) = read_multipart(multipart).await?;

    let task = tokio::spawn(async move {
        let _slot = slot;
        // 上传的文件优先于粘贴文本
        let target = if !files.is_empty() {
            let file = files.swap_remove(0);
            AuditTarget::Document(
                ingest_file(&file, &state.extractors, state.max_upload_bytes).await?,
            )
        } else {
            AuditTarget::Text(text.unwrap_or_default())
        };

        let project = state.workspace.read().await.project.clone();
        let outcome = state.auditor.audit(&project, &target).await;
        if let Some(entry) = outcome.log_entry {
            state.workspace.write().await.record(entry);
        }
        Ok::<_, BtbError>(outcome.result)
    });
    Ok(Json(task.await??))
}

async fn list_logs(State(state): State<AppState>) -> Json<Vec<AuditLogEntry>> {
    Json(state.workspace.read().await.log().entries().to_vec())
}

// ===== 引用解析 =====

#[derive(Serialize)]
struct ResolveResponse {
    found: bool,
    term: Option<String>,
    view: Option<DocumentView>,
}

async fn resolve_citation(
    State(state): State<AppState>,
    Json(citation): Json<Citation>,
) -> Json<ResolveResponse> {
    let ws = state.workspace.read().await;
    let resolution = resolve(&citation, ws.project.documents());
    Json(ResolveResponse {
        found: resolution.is_found(),
        term: resolution.term().map(str::to_string),
        view: resolution.view(),
    })
}

#[derive(Deserialize)]
struct BracketReq {
    content: String,
    /// `[` 在 content 中的字节位置
    start: usize,
}

async fn resolve_bracket_reference(
    State(state): State<AppState>,
    Json(req): Json<BracketReq>,
) -> Result<Json<ResolveResponse>> {
    let reference = reference_at(&req.content, req.start).ok_or(BtbError::InvalidRequest {
        reason: format!("no bracket reference at position {}", req.start),
    })?;
    let ws = state.workspace.read().await;
    let resolution = resolve_bracket(&req.content, &reference, ws.project.documents());
    Ok(Json(ResolveResponse {
        found: resolution.is_found(),
        term: resolution.term().map(str::to_string),
        view: resolution.view(),
    }))
}

async fn extract_health(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    match &state.extract_service {
        Some(service) => {
            service.health().await?;
            Ok(Json(json!({ "status": "ok" })))
        }
        None => Ok(Json(json!({ "status": "not_configured" }))),
    }
}
