//! 文本抽取。PDF 在本地用 lopdf 解析，docx 等富格式交给外部抽取服务，
//! 其余按 UTF-8 文本读取。抽取失败不会中断上传，由占位文本代替。

use std::time::Duration;

use async_trait::async_trait;
use btb_core::UploadedFile;
use btb_error::{BtbError, Result};
use tracing::{debug, instrument, warn};

/// PDF 最多抽取的页数
pub const MAX_PDF_PAGES: usize = 200;

pub const PDF_PLACEHOLDER: &str = "Unable to extract text from this PDF.";
pub const DOCUMENT_PLACEHOLDER: &str = "Unable to extract text from this document.";
pub const SERVICE_MISSING_PLACEHOLDER: &str = "Document extraction service not configured.";

#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, bytes: &[u8], file_name: &str, mime_type: &str) -> Result<String>;
}

/// 纯文本：按 UTF-8 读取，非法字节替换
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract_text(&self, bytes: &[u8], _file_name: &str, _mime_type: &str) -> Result<String> {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

pub struct PdfExtractor {
    max_pages: usize,
}

impl PdfExtractor {
    pub fn new(max_pages: usize) -> Self {
        Self {
            max_pages: max_pages.max(1),
        }
    }
}

impl Default for PdfExtractor {
    fn default() -> Self {
        Self::new(MAX_PDF_PAGES)
    }
}

/// 逐页抽取，每页之后换行。没有任何可见文本（扫描件）时返回空串。
fn pdf_text(bytes: &[u8], file_name: &str, max_pages: usize) -> Result<String> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| BtbError::Extraction {
        file: file_name.to_string(),
        message: e.to_string(),
    })?;

    let pages: Vec<u32> = doc.get_pages().keys().copied().take(max_pages).collect();
    let mut text = String::new();
    for page in &pages {
        match doc.extract_text(&[*page]) {
            Ok(page_text) => text.push_str(page_text.trim_end()),
            Err(e) => debug!(file = %file_name, page, error = %e, "skipping unreadable page"),
        }
        text.push('\n');
    }

    if text.trim().is_empty() {
        return Ok(String::new());
    }
    Ok(text)
}

#[async_trait]
impl TextExtractor for PdfExtractor {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn extract_text(&self, bytes: &[u8], file_name: &str, _mime_type: &str) -> Result<String> {
        let data = bytes.to_vec();
        let name = file_name.to_string();
        let max_pages = self.max_pages;
        tokio::task::spawn_blocking(move || pdf_text(&data, &name, max_pages)).await?
    }
}

/// 外部抽取服务：POST 原始字节，返回纯文本
pub struct ServiceExtractor {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    timeout: Duration,
}

impl ServiceExtractor {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            token,
            timeout,
        }
    }

    fn request(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    /// 健康检查：先 HEAD，不支持时回退 GET
    pub async fn health(&self) -> Result<()> {
        if let Ok(resp) = self.request(self.http.head(&self.url)).send().await {
            if resp.status().is_success() {
                return Ok(());
            }
        }
        let resp = self
            .request(self.http.get(&self.url))
            .send()
            .await
            .map_err(|e| BtbError::Network {
                operation: "extract_health_check".to_string(),
                message: e.to_string(),
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BtbError::ServiceUnavailable {
                service: format!("extract_service ({})", resp.status()),
            })
        }
    }
}

#[async_trait]
impl TextExtractor for ServiceExtractor {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn extract_text(&self, bytes: &[u8], file_name: &str, mime_type: &str) -> Result<String> {
        let mut rb = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/octet-stream")
            .header("X-Filename", file_name)
            .timeout(self.timeout)
            .body(bytes.to_vec());
        if let Some((_, ext)) = file_name.rsplit_once('.') {
            rb = rb.header("X-File-Ext", ext);
        }
        if !mime_type.is_empty() {
            rb = rb.header("X-Mime-Type", mime_type);
        }

        let resp = self.request(rb).send().await.map_err(|e| {
            if e.is_timeout() {
                BtbError::Timeout {
                    operation: "extract_request".to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                BtbError::Network {
                    operation: "extract_request".to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BtbError::Extraction {
                file: file_name.to_string(),
                message: format!("extract service returned {}", status),
            });
        }
        resp.text().await.map_err(|e| BtbError::Network {
            operation: "extract_response_read".to_string(),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Pdf,
    Rich,
    Plain,
}

fn classify(file_name: &str, mime_type: &str) -> FileKind {
    let lower = file_name.to_ascii_lowercase();
    if mime_type == "application/pdf" || lower.ends_with(".pdf") {
        FileKind::Pdf
    } else if lower.ends_with(".docx") {
        FileKind::Rich
    } else {
        FileKind::Plain
    }
}

/// 按文件类型分派到具体的抽取器
pub struct ExtractorRegistry {
    pdf: Box<dyn TextExtractor>,
    plain: Box<dyn TextExtractor>,
    rich: Option<Box<dyn TextExtractor>>,
}

impl ExtractorRegistry {
    pub fn new(max_pdf_pages: usize) -> Self {
        Self {
            pdf: Box::new(PdfExtractor::new(max_pdf_pages)),
            plain: Box::new(PlainTextExtractor),
            rich: None,
        }
    }

    pub fn with_rich_extractor(mut self, extractor: Box<dyn TextExtractor>) -> Self {
        self.rich = Some(extractor);
        self
    }

    /// 抽取文本，失败时返回占位文本而不是错误
    pub async fn extract_or_placeholder(&self, file: &UploadedFile) -> String {
        match self
            .extract_text(&file.bytes, &file.name, &file.mime_type)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(file = %file.name, error = %e, "text extraction failed, using placeholder");
                match (classify(&file.name, &file.mime_type), &self.rich) {
                    (FileKind::Pdf, _) => PDF_PLACEHOLDER.to_string(),
                    (FileKind::Rich, None) => SERVICE_MISSING_PLACEHOLDER.to_string(),
                    _ => DOCUMENT_PLACEHOLDER.to_string(),
                }
            }
        }
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new(MAX_PDF_PAGES)
    }
}

#[async_trait]
impl TextExtractor for ExtractorRegistry {
    async fn extract_text(&self, bytes: &[u8], file_name: &str, mime_type: &str) -> Result<String> {
        match classify(file_name, mime_type) {
            FileKind::Pdf => self.pdf.extract_text(bytes, file_name, mime_type).await,
            FileKind::Plain => self.plain.extract_text(bytes, file_name, mime_type).await,
            FileKind::Rich => match &self.rich {
                Some(rich) => rich.extract_text(bytes, file_name, mime_type).await,
                None => Err(BtbError::Configuration {
                    key: "extractor.url".to_string(),
                    reason: format!("no extractor configured for {}", file_name),
                }),
            },
        }
    }
}
