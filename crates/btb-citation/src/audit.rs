//! Deal memo 合规审计：结构化 JSON 请求 + 宽松的结果归一化。
//! 审计永远不向调用方返回错误，失败统一折叠为 warning 结果。

use std::sync::Arc;
use std::time::Instant;

use btb_core::{
    AuditLogEntry, Citation, Document, LogStatus, ProjectContext, ProjectMetadata, Severity,
    ValidationIssue, ValidationResult, ValidationStatus,
};
use btb_error::{BtbError, ErrorMetadataBuilder, Result};
use btb_llm::{GenerateOptions, ModelClient, Part};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::context::{truncate_chars, ContextBudget};

pub const AUDIT_TEMPERATURE: f32 = 0.1;

const SYSTEM_ERROR_RULE: &str = "System Error";
const FAILURE_SUMMARY: &str = "The audit failed to complete due to document complexity.";
const OVERFLOW_DESCRIPTION: &str = "The context provided was too large for the audit engine.";
const TEXT_SEGMENT_LABEL: &str = "Text Segment";
const TARGET_BINARY_MIME: &str = "application/pdf";

/// 审计对象：上传的文件或粘贴的文本
#[derive(Debug, Clone)]
pub enum AuditTarget {
    Document(Document),
    Text(String),
}

impl AuditTarget {
    /// 审计日志中使用的名字
    pub fn label(&self) -> &str {
        match self {
            AuditTarget::Document(doc) => doc.name(),
            AuditTarget::Text(_) => TEXT_SEGMENT_LABEL,
        }
    }

    pub fn has_content(&self) -> bool {
        match self {
            AuditTarget::Document(doc) => {
                doc.extracted_text().is_some() || doc.binary_payload().is_some()
            }
            AuditTarget::Text(text) => !text.trim().is_empty(),
        }
    }
}

/// 审计指令，作为最后一个片段发送
pub fn audit_instruction(meta: &ProjectMetadata) -> String {
    format!(
        r#"PERFORM COMPLIANCE AUDIT ON THE ATTACHED DEAL MEMO.
Context: {name} in {location} with a budget of ${budget}.
Dates: {start} to {end}.
Check against {unions} master agreements.
Identify:
1. Meal Penalty violations.
2. Rest period insufficiencies.
3. Rate discrepancies.
4. Health/Pension requirements.

Return JSON ONLY:
{{
  "status": "compliant" | "warning" | "violation",
  "issues": [
    {{
      "rule": "string",
      "description": "string",
      "severity": "high" | "medium" | "low",
      "source_reference": {{
        "docId": "string",
        "page": "number",
        "textSnippet": "verbatim text from the UNION CONTRACT (not the deal memo)",
        "sectionLabel": "string"
      }}
    }}
  ],
  "summary": "string"
}}"#,
        name = meta.name,
        location = meta.location,
        budget = meta.budget_amount,
        start = meta.start_date,
        end = meta.end_date,
        unions = meta.unions.join(", "),
    )
}

fn target_part(target: &AuditTarget, budget: usize) -> Option<Part> {
    let memo = |text: &str| {
        Part::text(format!(
            "Deal Memo Content to Audit:\n{}",
            truncate_chars(text, budget)
        ))
    };
    match target {
        AuditTarget::Document(doc) => match (doc.extracted_text(), doc.binary_payload()) {
            (Some(text), _) => Some(memo(text)),
            (None, Some(data)) => Some(Part::binary(data.to_vec(), TARGET_BINARY_MIME)),
            (None, None) => None,
        },
        AuditTarget::Text(text) if !text.trim().is_empty() => Some(memo(text)),
        AuditTarget::Text(_) => None,
    }
}

/// 组装审计请求片段：有文本的参考文档 → 审计目标 → 审计指令。
/// 目标没有内容时返回 None。
pub fn build_audit_request(
    project: &ProjectContext,
    target: &AuditTarget,
    budget: &ContextBudget,
) -> Option<Vec<Part>> {
    let target = target_part(target, budget.audit_target_chars)?;

    let mut parts: Vec<Part> = project
        .documents()
        .iter()
        .filter_map(|doc| {
            doc.extracted_text().map(|text| {
                Part::text(format!(
                    "Reference Document [{}]:\n{}",
                    doc.name(),
                    truncate_chars(text, budget.audit_reference_chars)
                ))
            })
        })
        .collect();
    parts.push(target);
    parts.push(Part::text(audit_instruction(&project.metadata)));
    Some(parts)
}

// ===== 结果解析 =====

#[derive(Deserialize)]
struct RawReport {
    status: String,
    #[serde(default)]
    issues: Vec<RawIssue>,
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize)]
struct RawIssue {
    #[serde(default)]
    rule: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    source_reference: Option<serde_json::Value>,
}

/// 去掉包裹在外层的 markdown 代码块
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // 跳过语言标记所在的行
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn parse_status(value: &str) -> Result<ValidationStatus> {
    match value.trim().to_ascii_lowercase().as_str() {
        "compliant" => Ok(ValidationStatus::Compliant),
        "warning" => Ok(ValidationStatus::Warning),
        "violation" => Ok(ValidationStatus::Violation),
        other => Err(BtbError::Validation {
            message: format!("unknown audit status {:?}", other),
        }),
    }
}

fn parse_severity(value: Option<&str>) -> Severity {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("high") => Severity::High,
        Some("low") => Severity::Low,
        _ => Severity::Medium,
    }
}

fn parse_reference(value: Option<serde_json::Value>) -> Option<Citation> {
    match value {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => match serde_json::from_value::<Citation>(v) {
            Ok(c) => Some(c),
            Err(e) => {
                debug!(error = %e, "dropping malformed source_reference");
                None
            }
        },
    }
}

/// 解析模型返回的审计 JSON 并归一化
pub fn parse_audit_response(raw: &str) -> Result<ValidationResult> {
    let report: RawReport = serde_json::from_str(strip_code_fence(raw))?;
    let status = parse_status(&report.status)?;
    let issues = report
        .issues
        .into_iter()
        .map(|issue| ValidationIssue {
            rule: issue.rule,
            description: issue.description,
            severity: parse_severity(issue.severity.as_deref()),
            source_reference: parse_reference(issue.source_reference),
        })
        .collect();
    Ok(ValidationResult {
        status,
        issues,
        summary: report.summary,
    })
}

/// 面向用户的失败说明，取错误自身携带的信息
fn failure_description(error: &BtbError) -> String {
    if error.is_context_overflow() {
        return OVERFLOW_DESCRIPTION.to_string();
    }
    match error {
        BtbError::Serialization { message, .. } => {
            format!("The audit response was not valid JSON: {}", message)
        }
        BtbError::Validation { message } => {
            format!("The audit response could not be interpreted: {}", message)
        }
        BtbError::LlmService { provider, message } => {
            format!("The audit model ({}) returned an error: {}", provider, message)
        }
        BtbError::Network { message, .. } => {
            format!("The audit model could not be reached: {}", message)
        }
        BtbError::Timeout { timeout_ms, .. } => {
            format!("The audit model did not respond within {} ms.", timeout_ms)
        }
        BtbError::ServiceUnavailable { service } => {
            format!("The {} service is unavailable.", service)
        }
        _ => "An unexpected error interrupted the audit.".to_string(),
    }
}

/// 审计失败时返回的 warning 结果
pub fn failure_result(error: &BtbError) -> ValidationResult {
    let description = failure_description(error);
    ValidationResult {
        status: ValidationStatus::Warning,
        issues: vec![ValidationIssue {
            rule: SYSTEM_ERROR_RULE.to_string(),
            description,
            severity: Severity::High,
            source_reference: None,
        }],
        summary: FAILURE_SUMMARY.to_string(),
    }
}

fn empty_target_result() -> ValidationResult {
    ValidationResult {
        status: ValidationStatus::Warning,
        issues: vec![ValidationIssue {
            rule: "No Content".to_string(),
            description: "Upload a deal memo or paste its text before running an audit."
                .to_string(),
            severity: Severity::Low,
            source_reference: None,
        }],
        summary: "Nothing was audited.".to_string(),
    }
}

/// 一次审计的产出。日志条目由调用方写入审计日志。
#[derive(Debug, Clone, PartialEq)]
pub struct AuditOutcome {
    pub result: ValidationResult,
    pub log_entry: Option<AuditLogEntry>,
}

pub struct AuditValidator {
    model: Arc<dyn ModelClient>,
    budget: ContextBudget,
}

impl AuditValidator {
    pub fn new(model: Arc<dyn ModelClient>, budget: ContextBudget) -> Self {
        Self { model, budget }
    }

    #[instrument(skip(self, project, target), fields(target = %target.label()))]
    pub async fn audit(&self, project: &ProjectContext, target: &AuditTarget) -> AuditOutcome {
        let Some(parts) = build_audit_request(project, target, &self.budget) else {
            info!("audit target has no content");
            return AuditOutcome {
                result: empty_target_result(),
                log_entry: None,
            };
        };

        let options = GenerateOptions {
            temperature: Some(AUDIT_TEMPERATURE),
            json_mode: true,
        };
        let started = Instant::now();
        let outcome = match self.model.generate("", &parts, &options).await {
            Ok(raw) => parse_audit_response(&raw),
            Err(e) => Err(e),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let metadata = ErrorMetadataBuilder::new("audit")
                    .operation("audit")
                    .project(&project.metadata.name)
                    .document(target.label())
                    .build(&e);
                e.log(&metadata);
                return AuditOutcome {
                    result: failure_result(&e),
                    log_entry: None,
                };
            }
        };

        info!(
            status = ?result.status,
            issues = result.issues.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "audit completed"
        );

        let status = if result.status == ValidationStatus::Violation {
            LogStatus::Violation
        } else {
            LogStatus::Compliant
        };
        let log_entry = AuditLogEntry::new(
            format!("Audit: {}", target.label()),
            status,
            result.citations(),
        );
        AuditOutcome {
            result,
            log_entry: Some(log_entry),
        }
    }
}
