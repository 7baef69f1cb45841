use btb_core::{Document, UploadedFile};
use btb_error::{BtbError, ErrorMetadataBuilder, Result};
use serde::Serialize;
use tracing::{info, instrument};

use crate::extract::ExtractorRegistry;

/// 单个文件处理失败
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestFailure {
    pub file: String,
    pub reason: String,
}

/// 批量上传结果：成功的文档按上传顺序排列，失败的文件单独列出
#[derive(Debug, Default)]
pub struct IngestReport {
    pub documents: Vec<Document>,
    pub failures: Vec<IngestFailure>,
}

/// 处理单个文件：抽取文本（失败用占位文本），PDF 额外保留原始字节
pub async fn ingest_file(
    file: &UploadedFile,
    extractors: &ExtractorRegistry,
    max_upload_bytes: usize,
) -> Result<Document> {
    if file.bytes.len() > max_upload_bytes {
        return Err(BtbError::Validation {
            message: format!(
                "{} is {} bytes, limit is {}",
                file.name,
                file.bytes.len(),
                max_upload_bytes
            ),
        });
    }
    let text = extractors.extract_or_placeholder(file).await;
    let binary = file.is_pdf().then(|| file.bytes.clone());
    Document::normalize(file, Some(text), binary)
}

/// 顺序处理一批文件。单个文件失败只记录，不影响其余文件。
#[instrument(skip_all, fields(files = files.len()))]
pub async fn ingest_files(
    files: Vec<UploadedFile>,
    extractors: &ExtractorRegistry,
    max_upload_bytes: usize,
) -> IngestReport {
    let mut report = IngestReport::default();
    for file in &files {
        match ingest_file(file, extractors, max_upload_bytes).await {
            Ok(doc) => report.documents.push(doc),
            Err(e) => {
                let metadata = ErrorMetadataBuilder::new("ingest")
                    .operation("ingest_file")
                    .document(&file.name)
                    .build(&e);
                e.log(&metadata);
                report.failures.push(IngestFailure {
                    file: file.name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
    info!(
        ingested = report.documents.len(),
        failed = report.failures.len(),
        "ingest finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::PDF_PLACEHOLDER;

    #[tokio::test]
    async fn test_partial_success_keeps_order() {
        let files = vec![
            UploadedFile::new("rates.txt", "text/plain", b"Scale rate 1,200".to_vec()),
            UploadedFile::new("empty.txt", "text/plain", Vec::new()),
            UploadedFile::new("huge.txt", "text/plain", vec![b'x'; 64]),
            UploadedFile::new("notes.md", "text/markdown", b"Turnaround 12h".to_vec()),
        ];
        let report = ingest_files(files, &ExtractorRegistry::default(), 32).await;

        let names: Vec<&str> = report.documents.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["rates.txt", "notes.md"]);
        let failed: Vec<&str> = report.failures.iter().map(|f| f.file.as_str()).collect();
        assert_eq!(failed, vec!["empty.txt", "huge.txt"]);
    }

    #[tokio::test]
    async fn test_pdf_keeps_binary_alongside_placeholder() {
        let file = UploadedFile::new("scan.pdf", "application/pdf", b"%PDF-broken".to_vec());
        let doc = ingest_file(&file, &ExtractorRegistry::default(), 1024)
            .await
            .unwrap();
        assert_eq!(doc.extracted_text(), Some(PDF_PLACEHOLDER));
        assert_eq!(doc.binary_payload(), Some(&b"%PDF-broken"[..]));

        let text = UploadedFile::new("memo.txt", "text/plain", b"memo".to_vec());
        let doc = ingest_file(&text, &ExtractorRegistry::default(), 1024)
            .await
            .unwrap();
        assert!(doc.binary_payload().is_none());
    }
}
