use btb_core::{ProjectContext, ProjectMetadata};
use btb_llm::Part;
use tracing::{debug, instrument};

use crate::protocol::citation_instructions;

/// 对话路径每个文档的字符上限（约 4 字符/token）
pub const CHAT_DOC_CHAR_BUDGET: usize = 150_000;
/// 审计路径参考文档的字符上限
pub const AUDIT_REFERENCE_CHAR_BUDGET: usize = 100_000;
/// 审计目标（deal memo）的字符上限
pub const AUDIT_TARGET_CHAR_BUDGET: usize = 150_000;

const FALLBACK_BINARY_MIME: &str = "application/pdf";

/// 各路径的上下文字符预算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    pub chat_doc_chars: usize,
    pub audit_reference_chars: usize,
    pub audit_target_chars: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            chat_doc_chars: CHAT_DOC_CHAR_BUDGET,
            audit_reference_chars: AUDIT_REFERENCE_CHAR_BUDGET,
            audit_target_chars: AUDIT_TARGET_CHAR_BUDGET,
        }
    }
}

/// 组装好的模型请求：系统指令 + 有序片段（文档在前，用户问题最后）
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledContext {
    pub system_instruction: String,
    pub parts: Vec<Part>,
}

/// 按字符（而非字节）截断
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        "Unknown"
    } else {
        value
    }
}

/// 对话系统指令：项目参数、已上传文档列表、引用格式要求
pub fn system_instruction(meta: &ProjectMetadata, document_names: &[&str]) -> String {
    let unions = if meta.unions.is_empty() {
        "N/A".to_string()
    } else {
        meta.unions.join(", ")
    };
    let budget = if meta.budget_amount.trim().is_empty() {
        "Unknown".to_string()
    } else {
        format!("${}", meta.budget_amount)
    };
    let doc_list = document_names
        .iter()
        .map(|n| format!("[{}]", n))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"You are "ByTheBook", an AI specialized in Labor Compliance for the film and television industry.
You have access to union agreements and production context provided in the conversation parts.

PRODUCTION PARAMETERS:
- Project: {name}
- Type: {production_type}
- Location: {location}
- Budget: {budget}
- Status: {status}
- Company: {company}
- Unions: {unions}
- Timeline: {start} to {end}

INGESTED DOCUMENTS: {doc_list}

GOAL:
Analyze the query and find specific answers within the provided contracts.
Always provide section-level citations and mention document names in brackets like [DocumentName.pdf].
Use a professional, legal, and compliance-oriented tone.

{citation_format}"#,
        name = or_unknown(&meta.name),
        production_type = or_unknown(&meta.production_type),
        location = or_unknown(&meta.location),
        budget = budget,
        status = or_unknown(&meta.status),
        company = or_unknown(&meta.production_company),
        unions = unions,
        start = or_unknown(&meta.start_date),
        end = or_unknown(&meta.end_date),
        doc_list = doc_list,
        citation_format = citation_instructions(),
    )
}

/// 对话路径的参考文档文本块
pub fn reference_block(name: &str, text: &str, budget: usize) -> String {
    format!(
        "REFERENCE DOCUMENT: {}\n---\n{}\n---\n",
        name,
        truncate_chars(text, budget)
    )
}

/// 组装对话请求。文本优先；只有没抽取到文本时才附带二进制。
#[instrument(skip(project, query), fields(documents = project.documents().len()))]
pub fn build_context(
    project: &ProjectContext,
    query: &str,
    per_document_char_budget: usize,
) -> AssembledContext {
    let names = project.document_names();
    let system_instruction = system_instruction(&project.metadata, &names);

    let mut parts = Vec::with_capacity(project.documents().len() + 1);
    for doc in project.documents() {
        if let Some(text) = doc.extracted_text() {
            let chars = text.chars().count();
            if chars > per_document_char_budget {
                debug!(
                    document = %doc.name(),
                    chars,
                    budget = per_document_char_budget,
                    "truncating document text"
                );
            }
            parts.push(Part::text(reference_block(
                doc.name(),
                text,
                per_document_char_budget,
            )));
        } else if let Some(data) = doc.binary_payload() {
            let mime = if doc.mime_type().is_empty() {
                FALLBACK_BINARY_MIME
            } else {
                doc.mime_type()
            };
            parts.push(Part::binary(data.to_vec(), mime));
        }
    }
    parts.push(Part::text(format!("User Query: {}", query)));

    AssembledContext {
        system_instruction,
        parts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btb_core::{Document, UploadedFile};

    fn doc(name: &str, text: Option<&str>, binary: Option<Vec<u8>>) -> Document {
        let file = UploadedFile::new(name, "application/pdf", vec![0; 4]);
        Document::normalize(&file, text.map(str::to_string), binary).unwrap()
    }

    fn project_with(docs: Vec<Document>) -> ProjectContext {
        let mut project = ProjectContext::new(ProjectMetadata {
            name: "Night Shift".into(),
            production_type: "Feature Film".into(),
            budget_amount: "5,000,000".into(),
            production_company: "Owl Pictures".into(),
            unions: vec!["SAG-AFTRA".into(), "IATSE".into()],
            location: "Atlanta".into(),
            start_date: "2025-01-06".into(),
            ..Default::default()
        });
        project.add_documents(docs);
        project
    }

    #[test]
    fn test_truncate_chars_counts_characters() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("ééé", 2), "éé");
        assert_eq!(truncate_chars("", 0), "");
    }

    #[test]
    fn test_order_is_system_documents_query() {
        let project = project_with(vec![
            doc("A.pdf", Some("alpha"), None),
            doc("B.pdf", Some("beta"), None),
        ]);
        let ctx = build_context(&project, "meal penalty?", CHAT_DOC_CHAR_BUDGET);
        assert_eq!(ctx.parts.len(), 3);
        assert!(ctx.parts[0].as_text().unwrap().starts_with("REFERENCE DOCUMENT: A.pdf"));
        assert!(ctx.parts[1].as_text().unwrap().starts_with("REFERENCE DOCUMENT: B.pdf"));
        assert_eq!(ctx.parts[2].as_text(), Some("User Query: meal penalty?"));
        assert!(ctx.system_instruction.contains("INGESTED DOCUMENTS: [A.pdf], [B.pdf]"));
    }

    #[test]
    fn test_truncates_to_exact_budget() {
        let long = "x".repeat(50);
        let project = project_with(vec![doc("Long.pdf", Some(&long), None), doc("Short.pdf", Some("tiny"), None)]);
        let ctx = build_context(&project, "q", 10);
        assert_eq!(
            ctx.parts[0].as_text(),
            Some(format!("REFERENCE DOCUMENT: Long.pdf\n---\n{}\n---\n", "x".repeat(10)).as_str())
        );
        assert_eq!(
            ctx.parts[1].as_text(),
            Some("REFERENCE DOCUMENT: Short.pdf\n---\ntiny\n---\n")
        );
    }

    #[test]
    fn test_binary_only_when_no_text() {
        let project = project_with(vec![
            doc("Both.pdf", Some("text wins"), Some(vec![1, 2, 3])),
            doc("Scan.pdf", None, Some(vec![9, 9])),
        ]);
        let ctx = build_context(&project, "q", CHAT_DOC_CHAR_BUDGET);
        assert_eq!(ctx.parts.len(), 3);
        assert!(ctx.parts[0].as_text().unwrap().contains("text wins"));
        assert_eq!(
            ctx.parts[1],
            Part::Binary {
                data: vec![9, 9],
                mime_type: "application/pdf".into()
            }
        );
    }

    #[test]
    fn test_system_instruction_embeds_metadata_and_defaults() {
        let project = project_with(vec![]);
        let text = system_instruction(&project.metadata, &[]);
        assert!(text.contains("- Project: Night Shift"));
        assert!(text.contains("- Budget: $5,000,000"));
        assert!(text.contains("- Company: Owl Pictures"));
        assert!(text.contains("- Unions: SAG-AFTRA, IATSE"));
        assert!(text.contains("- Timeline: 2025-01-06 to Unknown"));
        assert!(text.contains("- Status: Development"));
        assert!(text.contains("<CITATION>"));

        let empty = system_instruction(&ProjectMetadata::default(), &[]);
        assert!(empty.contains("- Unions: N/A"));
        assert!(empty.contains("- Timeline: Unknown to Unknown"));
        assert!(empty.contains("- Budget: Unknown"));
    }
}
