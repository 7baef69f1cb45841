use btb_core::{Citation, Document};
use serde::Serialize;
use tracing::debug;

use crate::highlight::{render_document, DocumentView};
use crate::protocol::{bracket_references, strip_bracket_references, BracketReference};

/// 方括号引用两侧截取的字符数
pub const BRACKET_CONTEXT_RADIUS: usize = 100;

/// 引用解析结果。模型可能编造 doc_id，找不到时返回 NotFound 而不是报错。
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<'a> {
    Found { document: &'a Document, term: String },
    NotFound,
}

impl<'a> Resolution<'a> {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found { .. })
    }

    pub fn document(&self) -> Option<&'a Document> {
        match self {
            Resolution::Found { document, .. } => Some(document),
            Resolution::NotFound => None,
        }
    }

    pub fn term(&self) -> Option<&str> {
        match self {
            Resolution::Found { term, .. } => Some(term),
            Resolution::NotFound => None,
        }
    }

    /// 带高亮的文档视图
    pub fn view(&self) -> Option<DocumentView> {
        match self {
            Resolution::Found { document, term } => Some(render_document(document, term)),
            Resolution::NotFound => None,
        }
    }
}

fn find_document<'a>(name: &str, documents: &'a [Document]) -> Option<&'a Document> {
    documents.iter().find(|d| d.name() == name)
}

/// 按 doc_id 精确匹配文档，高亮词取引用片段
pub fn resolve<'a>(citation: &Citation, documents: &'a [Document]) -> Resolution<'a> {
    match find_document(&citation.doc_id, documents) {
        Some(document) => Resolution::Found {
            document,
            term: citation.text_snippet.clone(),
        },
        None => {
            debug!(doc_id = %citation.doc_id, "citation does not match any document");
            Resolution::NotFound
        }
    }
}

fn back_chars(text: &str, from: usize, n: usize) -> usize {
    if n == 0 {
        return from;
    }
    text[..from]
        .char_indices()
        .rev()
        .nth(n - 1)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn forward_chars(text: &str, from: usize, n: usize) -> usize {
    text[from..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| from + i)
        .unwrap_or(text.len())
}

/// `[start, end)` 前后各扩展 radius 个字符，截断在文本边界内
pub fn context_window(content: &str, start: usize, end: usize, radius: usize) -> &str {
    let lo = back_chars(content, start, radius);
    let hi = forward_chars(content, end, radius);
    &content[lo..hi]
}

/// 解析正文中的 `[文档名]` 引用：高亮词为引用附近 ±100 字符、去掉方括号标记后的文本
pub fn resolve_bracket<'a>(
    content: &str,
    reference: &BracketReference,
    documents: &'a [Document],
) -> Resolution<'a> {
    let Some(document) = find_document(&reference.name, documents) else {
        return Resolution::NotFound;
    };
    let window = context_window(
        content,
        reference.start,
        reference.end,
        BRACKET_CONTEXT_RADIUS,
    );
    Resolution::Found {
        document,
        term: strip_bracket_references(window).trim().to_string(),
    }
}

/// 查找从给定字节位置开始的方括号引用
pub fn reference_at(content: &str, start: usize) -> Option<BracketReference> {
    bracket_references(content)
        .into_iter()
        .find(|r| r.start == start)
}

/// 消息渲染片段：普通文本或可点击的文档引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageSegment {
    Text { text: String },
    Reference { name: String, start: usize, end: usize },
}

/// 将消息正文切分为文本和文档引用。只有已上传文档的名字会变成引用。
pub fn segment_message(content: &str, documents: &[Document]) -> Vec<MessageSegment> {
    if documents.is_empty() {
        return vec![MessageSegment::Text {
            text: content.to_string(),
        }];
    }

    let mut segments = Vec::new();
    let mut pending = String::new();
    let mut last = 0;
    for r in bracket_references(content) {
        if find_document(&r.name, documents).is_none() {
            continue;
        }
        pending.push_str(&content[last..r.start]);
        if !pending.is_empty() {
            segments.push(MessageSegment::Text {
                text: std::mem::take(&mut pending),
            });
        }
        last = r.end;
        segments.push(MessageSegment::Reference {
            name: r.name,
            start: r.start,
            end: r.end,
        });
    }
    pending.push_str(&content[last..]);
    if !pending.is_empty() || segments.is_empty() {
        segments.push(MessageSegment::Text { text: pending });
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use btb_core::UploadedFile;

    fn doc(name: &str, text: &str) -> Document {
        let file = UploadedFile::new(name, "application/pdf", vec![0; 8]);
        Document::normalize(&file, Some(text.to_string()), None).unwrap()
    }

    fn citation(doc_id: &str, snippet: &str) -> Citation {
        Citation {
            doc_id: doc_id.to_string(),
            page: 1,
            text_snippet: snippet.to_string(),
            section_label: "1".to_string(),
        }
    }

    #[test]
    fn test_resolve_by_exact_name() {
        let docs = vec![doc("A.pdf", "Content A"), doc("B.pdf", "Content B")];
        let found = resolve(&citation("B.pdf", "Content"), &docs);
        assert_eq!(found.document(), Some(&docs[1]));
        assert_eq!(found.term(), Some("Content"));

        assert_eq!(resolve(&citation("C.pdf", "Content"), &docs), Resolution::NotFound);
        // 大小写不同也不算匹配
        assert!(!resolve(&citation("a.pdf", "Content"), &docs).is_found());
    }

    #[test]
    fn test_resolve_with_no_documents() {
        let resolution = resolve(&citation("Missing.pdf", "Content"), &[]);
        assert_eq!(resolution, Resolution::NotFound);
        assert!(resolution.view().is_none());
    }

    #[test]
    fn test_resolution_view_highlights_snippet() {
        let docs = vec![doc(
            "SAG.pdf",
            "Article 12. Meal periods shall be given within six hours of call.",
        )];
        let view = resolve(&citation("SAG.pdf", "meal periods shall be given"), &docs)
            .view()
            .unwrap();
        match view {
            DocumentView::Text { name, segments } => {
                assert_eq!(name, "SAG.pdf");
                assert_eq!(
                    crate::highlight::primary_match(&segments),
                    Some("periods shall be given")
                );
            }
            other => panic!("unexpected view {:?}", other),
        }
    }

    #[test]
    fn test_context_window_clips_to_bounds() {
        let content = "abc[X.pdf]def";
        assert_eq!(context_window(content, 3, 10, 100), content);
        assert_eq!(context_window(content, 3, 10, 1), "c[X.pdf]d");

        let long = format!("{}[X.pdf]{}", "é".repeat(150), "b".repeat(150));
        let start = "é".repeat(150).len();
        let window = context_window(&long, start, start + 7, 100);
        assert_eq!(window.chars().count(), 207);
    }

    #[test]
    fn test_resolve_bracket_uses_local_window() {
        let docs = vec![doc("SAG.pdf", "text")];
        let content = format!(
            "{}Meal breaks are due after six hours [SAG.pdf] unless waived [Other.pdf].{}",
            "x".repeat(200),
            "y".repeat(200)
        );
        let reference = bracket_references(&content)
            .into_iter()
            .find(|r| r.name == "SAG.pdf")
            .unwrap();
        let resolution = resolve_bracket(&content, &reference, &docs);
        let term = resolution.term().unwrap();
        assert!(term.contains("Meal breaks are due after six hours"));
        assert!(term.contains("unless waived"));
        assert!(!term.contains('['));
        assert!(!term.contains("Other.pdf"));
        assert!(term.chars().count() <= 2 * BRACKET_CONTEXT_RADIUS);

        let other = bracket_references(&content)
            .into_iter()
            .find(|r| r.name == "Other.pdf")
            .unwrap();
        assert_eq!(resolve_bracket(&content, &other, &docs), Resolution::NotFound);
    }

    #[test]
    fn test_reference_at() {
        let content = "See [A.pdf] now";
        assert_eq!(reference_at(content, 4).unwrap().name, "A.pdf");
        assert!(reference_at(content, 5).is_none());
    }

    #[test]
    fn test_segment_message() {
        let docs = vec![doc("A.pdf", "a")];
        let segments = segment_message("Per [A.pdf] and [Z.pdf], ok", &docs);
        assert_eq!(
            segments,
            vec![
                MessageSegment::Text {
                    text: "Per ".into()
                },
                MessageSegment::Reference {
                    name: "A.pdf".into(),
                    start: 4,
                    end: 11
                },
                MessageSegment::Text {
                    text: " and [Z.pdf], ok".into()
                },
            ]
        );

        assert_eq!(
            segment_message("Per [A.pdf]", &[]),
            vec![MessageSegment::Text {
                text: "Per [A.pdf]".into()
            }]
        );
    }
}
