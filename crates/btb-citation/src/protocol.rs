//! 引用协议：生成提示词中的引用格式要求，解析模型回复中的引用块。
//!
//! 引用块格式固定为
//!
//! ```text
//! <CITATION>
//! { "docId": "...", "page": 12, "textSnippet": "...", "sectionLabel": "..." }
//! </CITATION>
//! ```
//!
//! 解析分两步：先从左到右定位互不重叠的标签对，再逐块独立解析 JSON。
//! 无论 JSON 是否有效，匹配到的块都会从正文中移除。

use btb_core::Citation;
use btb_error::Result;
use serde::Serialize;
use tracing::debug;

pub const CITATION_OPEN: &str = "<CITATION>";
pub const CITATION_CLOSE: &str = "</CITATION>";

/// 系统指令中的引用格式要求
pub fn citation_instructions() -> String {
    format!(
        r#"CITATION FORMAT:
When you find a specific clause or rule, you MUST include a machine-readable citation block immediately after the relevant paragraph, in the following format:
{open}
{{
  "docId": "exact_document_name.pdf",
  "page": 12,
  "textSnippet": "exact text from document",
  "sectionLabel": "Article 12.A"
}}
{close}
The object must contain exactly the fields docId, page, textSnippet and sectionLabel.
Use the document names exactly as listed under INGESTED DOCUMENTS for docId.
Whenever you refer to a document in prose, mention its name in brackets like [DocumentName.pdf]."#,
        open = CITATION_OPEN,
        close = CITATION_CLOSE
    )
}

/// 将单条引用编码为线上格式
pub fn encode_citation(citation: &Citation) -> Result<String> {
    let json = serde_json::to_string(citation)?;
    Ok(format!("{}\n{}\n{}", CITATION_OPEN, json, CITATION_CLOSE))
}

/// 模型回复解析结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedResponse {
    /// 去掉引用块后的正文，未做 trim
    pub content: String,
    pub citations: Vec<Citation>,
}

impl DecodedResponse {
    pub fn display_text(&self) -> &str {
        self.content.trim()
    }
}

/// 引用块在原文中的字节区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub start: usize,
    pub end: usize,
    pub body_start: usize,
    pub body_end: usize,
}

/// 从左到右定位所有互不重叠的引用块；第一个闭合标签结束当前块
pub fn locate_blocks(text: &str) -> Vec<BlockSpan> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = text[cursor..].find(CITATION_OPEN) {
        let start = cursor + rel;
        let body_start = start + CITATION_OPEN.len();
        let Some(close_rel) = text[body_start..].find(CITATION_CLOSE) else {
            // 之后不会再有闭合标签
            break;
        };
        let body_end = body_start + close_rel;
        let end = body_end + CITATION_CLOSE.len();
        spans.push(BlockSpan {
            start,
            end,
            body_start,
            body_end,
        });
        cursor = end;
    }
    spans
}

fn parse_citation(body: &str) -> Option<Citation> {
    match serde_json::from_str::<Citation>(body) {
        Ok(c) => Some(c),
        Err(e) => {
            debug!(error = %e, "dropping malformed citation block");
            None
        }
    }
}

/// 解析模型回复：提取引用并从正文移除所有引用块。纯函数，不会失败。
pub fn decode(raw: &str) -> DecodedResponse {
    let spans = locate_blocks(raw);
    let mut content = String::with_capacity(raw.len());
    let mut citations = Vec::with_capacity(spans.len());
    let mut last = 0;

    for span in &spans {
        content.push_str(&raw[last..span.start]);
        if let Some(citation) = parse_citation(&raw[span.body_start..span.body_end]) {
            citations.push(citation);
        }
        last = span.end;
    }
    content.push_str(&raw[last..]);

    if spans.len() != citations.len() {
        debug!(
            blocks = spans.len(),
            parsed = citations.len(),
            "some citation blocks were dropped"
        );
    }

    DecodedResponse { content, citations }
}

/// 正文中的 `[文档名]` 引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BracketReference {
    pub name: String,
    /// `[` 的字节位置
    pub start: usize,
    /// `]` 之后的字节位置
    pub end: usize,
}

fn is_line_break(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

/// 定位所有方括号引用：取最短匹配，括号内不能跨行
pub fn bracket_references(text: &str) -> Vec<BracketReference> {
    let bytes = text.as_bytes();
    let mut refs = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            let close = bytes[i + 1..]
                .iter()
                .position(|&b| b == b']' || is_line_break(b))
                .map(|off| i + 1 + off);
            if let Some(close) = close.filter(|&c| bytes[c] == b']') {
                refs.push(BracketReference {
                    name: text[i + 1..close].to_string(),
                    start: i,
                    end: close + 1,
                });
                i = close + 1;
                continue;
            }
        }
        i += 1;
    }
    refs
}

/// 移除文本中所有方括号引用（含括号内文字）
pub fn strip_bracket_references(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for r in bracket_references(text) {
        out.push_str(&text[last..r.start]);
        last = r.end;
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn citation(doc: &str, page: i64, snippet: &str, label: &str) -> Citation {
        Citation {
            doc_id: doc.to_string(),
            page,
            text_snippet: snippet.to_string(),
            section_label: label.to_string(),
        }
    }

    #[test]
    fn test_decode_single_inline_block() {
        let raw = "Penalty after 6h.\n<CITATION>{\"docId\":\"X.pdf\",\"page\":1,\"textSnippet\":\"t\",\"sectionLabel\":\"S1\"}</CITATION>";
        let decoded = decode(raw);
        assert_eq!(decoded.content, "Penalty after 6h.\n");
        assert_eq!(decoded.display_text(), "Penalty after 6h.");
        assert_eq!(decoded.citations, vec![citation("X.pdf", 1, "t", "S1")]);
    }

    #[test]
    fn test_decode_without_blocks_is_identity() {
        for raw in ["Just normal text.", "", "  spaced  \n", "<citation>{}</citation>"] {
            let decoded = decode(raw);
            assert_eq!(decoded.content, raw);
            assert!(decoded.citations.is_empty());
        }
    }

    #[test]
    fn test_decode_multiple_blocks_in_order() {
        let raw = r#"
First point.
<CITATION>{"docId": "a.pdf", "page": 1, "textSnippet": "A", "sectionLabel": "A"}</CITATION>
Second point.
<CITATION>{"docId": "b.pdf", "page": 2, "textSnippet": "B", "sectionLabel": "B"}</CITATION>
    "#;
        let decoded = decode(raw);
        assert_eq!(decoded.citations.len(), 2);
        assert_eq!(decoded.citations[0].doc_id, "a.pdf");
        assert_eq!(decoded.citations[1].doc_id, "b.pdf");
        assert!(decoded.content.contains("First point."));
        assert!(decoded.content.contains("Second point."));
        assert!(!decoded.content.contains(CITATION_OPEN));
        assert!(!decoded.content.contains(CITATION_CLOSE));
    }

    #[test]
    fn test_decode_pretty_printed_block() {
        let raw = r#"According to the agreement...
<CITATION>
{
  "docId": "contract.pdf",
  "page": 10,
  "textSnippet": "The rule is X",
  "sectionLabel": "12.A"
}
</CITATION>
"#;
        let decoded = decode(raw);
        assert_eq!(decoded.citations.len(), 1);
        assert_eq!(decoded.citations[0].page, 10);
        assert_eq!(decoded.display_text(), "According to the agreement...");
    }

    #[test]
    fn test_malformed_block_is_stripped_and_dropped() {
        let decoded = decode("<CITATION>{ bad json </CITATION>");
        assert!(decoded.citations.is_empty());
        assert_eq!(decoded.content, "");

        let raw = "Before <CITATION>{\"docId\":\"a.pdf\",\"page\":1,\"textSnippet\":\"A\",\"sectionLabel\":\"1\"}</CITATION> middle <CITATION>{ \"docId\": \"bad.pdf\", \"page\": 1 </CITATION> after";
        let decoded = decode(raw);
        assert_eq!(decoded.citations.len(), 1);
        assert_eq!(decoded.content, "Before  middle  after");
    }

    #[test]
    fn test_first_closing_tag_terminates_block() {
        let raw = "x<CITATION>a<CITATION>{\"docId\":\"a.pdf\",\"page\":1,\"textSnippet\":\"A\",\"sectionLabel\":\"1\"}</CITATION>tail</CITATION>y";
        let decoded = decode(raw);
        // 内层开标签被吞进第一个块，JSON 无效
        assert!(decoded.citations.is_empty());
        assert_eq!(decoded.content, "xtail</CITATION>y");
    }

    #[test]
    fn test_unterminated_block_is_left_alone() {
        let raw = "text <CITATION>{\"docId\":\"a.pdf\"}";
        let decoded = decode(raw);
        assert_eq!(decoded.content, raw);
        assert!(decoded.citations.is_empty());
    }

    #[test]
    fn test_encode_then_decode_preserves_fields() {
        let original = citation("SAG_Basic.pdf", 12, "Meal periods shall be \"not less\" than...", "Section 12");
        let wire = encode_citation(&original).unwrap();
        assert!(wire.starts_with("<CITATION>\n{"));
        assert!(wire.ends_with("}\n</CITATION>"));

        let decoded = decode(&format!("The meal penalty is triggered after 6 hours.\n{}", wire));
        assert_eq!(decoded.citations, vec![original]);
        assert_eq!(
            decoded.display_text(),
            "The meal penalty is triggered after 6 hours."
        );
    }

    #[test]
    fn test_decode_is_deterministic() {
        let raw = "A <CITATION>{\"docId\":\"a.pdf\",\"page\":1,\"textSnippet\":\"A\",\"sectionLabel\":\"1\"}</CITATION> B";
        assert_eq!(decode(raw), decode(raw));
    }

    #[test]
    fn test_instructions_name_the_wire_fields() {
        let text = citation_instructions();
        assert!(text.contains("<CITATION>"));
        assert!(text.contains("</CITATION>"));
        for field in ["\"docId\"", "\"page\"", "\"textSnippet\"", "\"sectionLabel\""] {
            assert!(text.contains(field), "missing {}", field);
        }
        assert!(text.contains("[DocumentName.pdf]"));
    }

    #[test]
    fn test_bracket_references() {
        let text = "See [A.pdf] and [B.pdf].\nBroken [C.pdf\n] and [x [y] end";
        let refs = bracket_references(text);
        let names: Vec<&str> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["A.pdf", "B.pdf", "x [y"]);
        assert_eq!(&text[refs[0].start..refs[0].end], "[A.pdf]");
    }

    #[test]
    fn test_strip_bracket_references() {
        assert_eq!(
            strip_bracket_references("Per [A.pdf], meals every 6h [B.pdf]."),
            "Per , meals every 6h ."
        );
        assert_eq!(strip_bracket_references("no refs"), "no refs");
    }
}
