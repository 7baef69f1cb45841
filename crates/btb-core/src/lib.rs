use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub use btb_error::{BtbError as Error, Result};

/// 上传的原始文件（抽取前）
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn is_pdf(&self) -> bool {
        self.mime_type == "application/pdf" || self.name.to_ascii_lowercase().ends_with(".pdf")
    }

    pub fn is_docx(&self) -> bool {
        self.name.to_ascii_lowercase().ends_with(".docx")
    }
}

/// 归一化后的文档：文本优先，二进制为兜底。
/// 内容以 `Arc` 共享，克隆项目快照不复制文本和二进制。
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    name: String,
    mime_type: String,
    extracted_text: Option<Arc<str>>,
    binary_payload: Option<Arc<[u8]>>,
    size_bytes: u64,
}

impl Document {
    /// 将上传文件与已抽取的文本包装成 Document。
    ///
    /// 空字符串视为没有抽取到文本；文本与二进制至少要有一个。
    pub fn normalize(
        file: &UploadedFile,
        extracted_text: Option<String>,
        binary_payload: Option<Vec<u8>>,
    ) -> Result<Self> {
        let extracted_text: Option<Arc<str>> =
            extracted_text.filter(|t| !t.is_empty()).map(Arc::from);
        let binary_payload: Option<Arc<[u8]>> =
            binary_payload.filter(|b| !b.is_empty()).map(Arc::from);
        if extracted_text.is_none() && binary_payload.is_none() {
            return Err(Error::Validation {
                message: format!("document {} has neither text nor binary content", file.name),
            });
        }
        Ok(Self {
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            extracted_text,
            binary_payload,
            size_bytes: file.bytes.len() as u64,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn extracted_text(&self) -> Option<&str> {
        self.extracted_text.as_deref()
    }

    pub fn binary_payload(&self) -> Option<&[u8]> {
        self.binary_payload.as_deref()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            size_bytes: self.size_bytes,
            text_chars: self.extracted_text.as_ref().map(|t| t.chars().count()),
            has_binary: self.binary_payload.is_some(),
        }
    }
}

/// 对外展示用的文档摘要（不含内容）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub text_chars: Option<usize>,
    pub has_binary: bool,
}

/// 制作项目元数据，持久化快照只保存这一部分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectMetadata {
    pub name: String,
    pub production_type: String,
    pub budget_amount: String,
    pub status: String,
    pub production_company: String,
    pub unions: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub location: String,
    pub paymaster_id: String,
    pub notes: String,
}

impl Default for ProjectMetadata {
    fn default() -> Self {
        Self {
            name: String::new(),
            production_type: String::new(),
            budget_amount: String::new(),
            status: "Development".to_string(),
            production_company: String::new(),
            unions: Vec::new(),
            start_date: String::new(),
            end_date: String::new(),
            location: String::new(),
            paymaster_id: String::new(),
            notes: String::new(),
        }
    }
}

/// 项目上下文：元数据 + 按上传顺序排列的文档
#[derive(Debug, Clone, Default)]
pub struct ProjectContext {
    pub metadata: ProjectMetadata,
    documents: Vec<Document>,
}

impl ProjectContext {
    pub fn new(metadata: ProjectMetadata) -> Self {
        Self {
            metadata,
            documents: Vec::new(),
        }
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn document(&self, name: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.name == name)
    }

    pub fn document_names(&self) -> Vec<&str> {
        self.documents.iter().map(|d| d.name.as_str()).collect()
    }

    /// 追加文档；同名文档原位替换，保持名称唯一。返回被替换的旧文档。
    pub fn add_document(&mut self, document: Document) -> Option<Document> {
        match self.documents.iter().position(|d| d.name == document.name) {
            Some(idx) => {
                tracing::warn!(document = %document.name, "replacing document with the same name");
                Some(std::mem::replace(&mut self.documents[idx], document))
            }
            None => {
                self.documents.push(document);
                None
            }
        }
    }

    pub fn add_documents(&mut self, documents: impl IntoIterator<Item = Document>) {
        for doc in documents {
            self.add_document(doc);
        }
    }

    pub fn remove_document(&mut self, name: &str) -> Option<Document> {
        let idx = self.documents.iter().position(|d| d.name == name)?;
        Some(self.documents.remove(idx))
    }
}

/// 模型生成的引用。doc_id 由模型自由生成，不保证对应真实文档。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub doc_id: String,
    #[serde(deserialize_with = "page_number")]
    pub page: i64,
    pub text_snippet: String,
    pub section_label: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PageRepr {
    Int(i64),
    Float(f64),
    Text(String),
}

// 审计模板里 page 写作 "number"，模型偶尔会返回字符串或小数
fn page_number<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    match PageRepr::deserialize(deserializer)? {
        PageRepr::Int(n) => Ok(n),
        PageRepr::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
        PageRepr::Float(f) => Err(D::Error::custom(format!("invalid page number {}", f))),
        PageRepr::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| D::Error::custom(format!("invalid page number {:?}", s))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// 对话消息，content 中已去除引用标记
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub is_loading: bool,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            citations: Vec::new(),
            is_loading: false,
        }
    }

    pub fn assistant(content: impl Into<String>, citations: Vec<Citation>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            citations,
            is_loading: false,
        }
    }

    /// 请求处理中的占位消息
    pub fn loading(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            citations: Vec::new(),
            is_loading: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Compliant,
    Warning,
    Violation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub rule: String,
    pub description: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<Citation>,
}

/// 一次审计的完整结果，整体生成，不做局部更新
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub issues: Vec<ValidationIssue>,
    pub summary: String,
}

impl ValidationResult {
    /// 所有问题中附带的来源引用，按问题顺序
    pub fn citations(&self) -> Vec<Citation> {
        self.issues
            .iter()
            .filter_map(|i| i.source_reference.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Compliant,
    Violation,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Citation>>,
}

impl AuditLogEntry {
    /// 空引用列表记为 None
    pub fn new(query: impl Into<String>, status: LogStatus, citations: Vec<Citation>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            query: query.into(),
            status,
            citations: if citations.is_empty() {
                None
            } else {
                Some(citations)
            },
        }
    }
}

/// 只追加、最新在前的审计日志
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditLog {
    entries: Vec<AuditLogEntry>,
}

impl AuditLog {
    pub fn record(&mut self, entry: AuditLogEntry) {
        let mut next = Vec::with_capacity(self.entries.len() + 1);
        next.push(entry);
        next.extend(self.entries.iter().cloned());
        self.entries = next;
    }

    pub fn entries(&self) -> &[AuditLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
