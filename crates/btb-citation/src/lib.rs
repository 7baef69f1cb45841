//! 带引用的合规问答核心：上下文组装、引用协议、引用解析、审计与会话。

pub mod audit;
pub mod context;
pub mod extract;
pub mod highlight;
pub mod ingest;
pub mod protocol;
pub mod resolver;
pub mod session;

pub use audit::{
    audit_instruction, build_audit_request, failure_result, parse_audit_response, AuditOutcome,
    AuditTarget, AuditValidator,
};
pub use context::{build_context, truncate_chars, AssembledContext, ContextBudget};
pub use extract::{
    ExtractorRegistry, PdfExtractor, PlainTextExtractor, ServiceExtractor, TextExtractor,
};
pub use highlight::{derive_pattern, highlight, render_document, DocumentView, Segment, SegmentKind};
pub use ingest::{ingest_file, ingest_files, IngestFailure, IngestReport};
pub use protocol::{
    bracket_references, citation_instructions, decode, encode_citation, BracketReference,
    DecodedResponse,
};
pub use resolver::{
    reference_at, resolve, resolve_bracket, segment_message, MessageSegment, Resolution,
};
pub use session::{
    ChatSession, ChatTurn, OwnedSubmissionGuard, SubmissionGuard, SubmissionSlot, Workspace,
};

pub use btb_error::{BtbError, Result};
