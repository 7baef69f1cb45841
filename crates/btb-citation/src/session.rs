//! 会话状态与对话流程。
//!
//! `Workspace` 持有项目、消息列表和审计日志；模型调用不在其内部进行，
//! 调用方先取快照、释放锁，再把结果写回。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use btb_core::{AuditLog, AuditLogEntry, LogStatus, Message, ProjectContext, ProjectMetadata, Role};
use btb_error::{BtbError, ErrorMetadataBuilder, Result};
use btb_llm::{GenerateOptions, ModelClient};
use tracing::{info, instrument};

use crate::context::build_context;
use crate::protocol::decode;

pub const CHAT_TEMPERATURE: f32 = 0.15;

pub const LOADING_MESSAGE: &str = "Analyzing project contracts...";
pub const EMPTY_REPLY_FALLBACK: &str =
    "I was unable to retrieve a definitive answer from the current documents.";
pub const CONTEXT_OVERFLOW_REPLY: &str = "The total volume of document text exceeds the model's capacity. Please remove some documents or provide more specific queries.";
pub const GENERIC_FAILURE_REPLY: &str = "An error occurred while processing your request. The documents may be too complex or there's a connectivity issue.";

// ===== 提交槽 =====

/// 同一时间只允许一个进行中的提交
#[derive(Debug)]
pub struct SubmissionSlot {
    name: &'static str,
    busy: AtomicBool,
}

/// 持有期间槽位被占用，drop 时释放
#[derive(Debug)]
pub struct SubmissionGuard<'a> {
    slot: &'a SubmissionSlot,
}

impl SubmissionSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            busy: AtomicBool::new(false),
        }
    }

    fn occupy(&self) -> Result<()> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| BtbError::Conflict {
                details: format!("a {} request is already in progress", self.name),
            })
    }

    pub fn try_acquire(&self) -> Result<SubmissionGuard<'_>> {
        self.occupy().map(|_| SubmissionGuard { slot: self })
    }

    /// 与 `try_acquire` 相同，但凭证持有 `Arc`，可以移入后台任务
    pub fn try_acquire_owned(self: Arc<Self>) -> Result<OwnedSubmissionGuard> {
        self.occupy()?;
        Ok(OwnedSubmissionGuard { slot: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for SubmissionGuard<'_> {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct OwnedSubmissionGuard {
    slot: Arc<SubmissionSlot>,
}

impl Drop for OwnedSubmissionGuard {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

// ===== 对话 =====

/// 一轮对话的结果。模型失败时 reply 为错误提示，且没有日志条目。
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub reply: Message,
    pub log_entry: Option<AuditLogEntry>,
}

pub struct ChatSession {
    model: Arc<dyn ModelClient>,
    per_document_char_budget: usize,
}

/// 提问前的校验：问题不能为空，项目必须有名字
pub fn validate_query(project: &ProjectContext, query: &str) -> Result<()> {
    if query.trim().is_empty() {
        return Err(BtbError::InvalidRequest {
            reason: "query is empty".to_string(),
        });
    }
    if project.metadata.name.trim().is_empty() {
        return Err(BtbError::InvalidRequest {
            reason: "project name must be set before asking questions".to_string(),
        });
    }
    Ok(())
}

impl ChatSession {
    pub fn new(model: Arc<dyn ModelClient>, per_document_char_budget: usize) -> Self {
        Self {
            model,
            per_document_char_budget,
        }
    }

    #[instrument(skip(self, project, query), fields(project = %project.metadata.name))]
    pub async fn ask(&self, project: &ProjectContext, query: &str) -> Result<ChatTurn> {
        validate_query(project, query)?;

        let ctx = build_context(project, query, self.per_document_char_budget);
        let options = GenerateOptions {
            temperature: Some(CHAT_TEMPERATURE),
            json_mode: false,
        };
        let started = Instant::now();
        let raw = match self
            .model
            .generate(&ctx.system_instruction, &ctx.parts, &options)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                let metadata = ErrorMetadataBuilder::new("chat")
                    .operation("ask")
                    .project(&project.metadata.name)
                    .context("documents", &project.documents().len().to_string())
                    .build(&e);
                e.log(&metadata);
                let text = if e.is_context_overflow() {
                    CONTEXT_OVERFLOW_REPLY
                } else {
                    GENERIC_FAILURE_REPLY
                };
                return Ok(ChatTurn {
                    reply: Message::assistant(text, Vec::new()),
                    log_entry: None,
                });
            }
        };

        let raw = if raw.trim().is_empty() {
            EMPTY_REPLY_FALLBACK.to_string()
        } else {
            raw
        };
        let decoded = decode(&raw);
        info!(
            citations = decoded.citations.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat answered"
        );

        let text = decoded.display_text().to_string();
        let log_entry = AuditLogEntry::new(query, LogStatus::Info, decoded.citations.clone());
        Ok(ChatTurn {
            reply: Message::assistant(text, decoded.citations),
            log_entry: Some(log_entry),
        })
    }
}

// ===== 工作区 =====

/// 单个用户的工作区：项目、对话记录、审计日志
#[derive(Debug, Default)]
pub struct Workspace {
    pub project: ProjectContext,
    messages: Vec<Message>,
    log: AuditLog,
}

impl Workspace {
    pub fn new(metadata: ProjectMetadata) -> Self {
        Self {
            project: ProjectContext::new(metadata),
            messages: Vec::new(),
            log: AuditLog::default(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn log(&self) -> &AuditLog {
        &self.log
    }

    /// 记录用户问题并追加一条加载中的助手消息
    pub fn begin_chat(&mut self, query: &str) {
        self.messages.push(Message::user(query));
        self.messages.push(Message::loading(LOADING_MESSAGE));
    }

    /// 用回复替换末尾的加载消息，并写入审计日志
    pub fn complete_chat(&mut self, turn: ChatTurn) {
        if matches!(self.messages.last(), Some(m) if m.is_loading && m.role == Role::Assistant) {
            self.messages.pop();
        }
        self.messages.push(turn.reply);
        if let Some(entry) = turn.log_entry {
            self.log.record(entry);
        }
    }

    pub fn record(&mut self, entry: AuditLogEntry) {
        self.log.record(entry);
    }
}
