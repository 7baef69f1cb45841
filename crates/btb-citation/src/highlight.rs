//! 文档高亮：模型给出的片段很少是逐字引用，所以用若干关键词加任意间隔做模糊匹配。
//! 只保证尽力而为，第一个匹配为主高亮。

use btb_core::Document;
use regex::RegexBuilder;
use serde::Serialize;
use tracing::warn;

const MIN_TOKEN_CHARS: usize = 5;
const MAX_TOKENS: usize = 4;
const FALLBACK_WORDS: usize = 3;
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

fn is_separator(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | '.' | ';' | ':')
}

/// 从高亮词推导匹配模式：取前 4 个长度大于 4 的词，用惰性任意间隔连接；
/// 没有合格词时退回前三个空白分隔的词。
pub fn derive_pattern(term: &str) -> Option<String> {
    let tokens: Vec<&str> = term
        .split(is_separator)
        .filter(|w| w.chars().count() >= MIN_TOKEN_CHARS)
        .take(MAX_TOKENS)
        .collect();
    let words: Vec<&str> = if tokens.is_empty() {
        term.split_whitespace().take(FALLBACK_WORDS).collect()
    } else {
        tokens
    };
    if words.is_empty() {
        return None;
    }
    Some(
        words
            .iter()
            .map(|w| regex::escape(w))
            .collect::<Vec<_>>()
            .join(".*?"),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Plain,
    /// 后续匹配，不做特殊处理
    Match,
    /// 第一个匹配
    Primary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub text: String,
    pub kind: SegmentKind,
}

impl Segment {
    fn new(text: &str, kind: SegmentKind) -> Self {
        Self {
            text: text.to_string(),
            kind,
        }
    }
}

/// 将文本切分为未匹配/匹配交替的片段。模式为空或编译失败时返回整段原文。
pub fn highlight(text: &str, term: &str) -> Vec<Segment> {
    let Some(pattern) = derive_pattern(term) else {
        return vec![Segment::new(text, SegmentKind::Plain)];
    };
    let regex = match RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
    {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "highlight pattern rejected, showing plain text");
            return vec![Segment::new(text, SegmentKind::Plain)];
        }
    };

    let mut segments = Vec::new();
    let mut last = 0;
    for (i, m) in regex.find_iter(text).enumerate() {
        if m.start() > last {
            segments.push(Segment::new(&text[last..m.start()], SegmentKind::Plain));
        }
        let kind = if i == 0 {
            SegmentKind::Primary
        } else {
            SegmentKind::Match
        };
        segments.push(Segment::new(m.as_str(), kind));
        last = m.end();
    }
    if last < text.len() || segments.is_empty() {
        segments.push(Segment::new(&text[last..], SegmentKind::Plain));
    }
    segments
}

pub fn primary_match(segments: &[Segment]) -> Option<&str> {
    segments
        .iter()
        .find(|s| s.kind == SegmentKind::Primary)
        .map(|s| s.text.as_str())
}

/// 文档查看视图
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentView {
    Text { name: String, segments: Vec<Segment> },
    /// 只有二进制内容，无法预览
    BinaryOnly { name: String },
}

pub fn render_document(document: &Document, term: &str) -> DocumentView {
    match document.extracted_text() {
        Some(text) => DocumentView::Text {
            name: document.name().to_string(),
            segments: highlight(text, term),
        },
        None => DocumentView::BinaryOnly {
            name: document.name().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btb_core::UploadedFile;

    const CONTRACT: &str = "Section 12. MEAL PERIODS. Performers shall be given a meal period \
        not later than six hours after the call. A meal penalty applies otherwise. \
        Later, meal periods are discussed again.";

    #[test]
    fn test_derive_pattern_keeps_long_tokens() {
        assert_eq!(
            derive_pattern("Meal periods shall be not less than six hours, per rule").as_deref(),
            Some("periods.*?shall.*?hours")
        );
        assert_eq!(
            derive_pattern("alpha bravo charlie delta foxtrot").as_deref(),
            Some("alpha.*?bravo.*?charlie.*?delta")
        );
        assert_eq!(derive_pattern("Content").as_deref(), Some("Content"));
    }

    #[test]
    fn test_derive_pattern_falls_back_to_first_words() {
        assert_eq!(derive_pattern("a b c d").as_deref(), Some("a.*?b.*?c"));
        assert_eq!(derive_pattern(""), None);
        assert_eq!(derive_pattern("   "), None);
        assert_eq!(derive_pattern("a\tb\nc d").as_deref(), Some("a.*?b.*?c"));
    }

    #[test]
    fn test_derive_pattern_escapes_tokens() {
        let pattern = derive_pattern("(rate) applies [12.A]").unwrap();
        assert_eq!(pattern, r"\(rate\).*?applies");
        assert!(regex::Regex::new(&pattern).is_ok());
    }

    #[test]
    fn test_fuzzy_gap_match_is_case_insensitive() {
        let segments = highlight(CONTRACT, "meal period not later than six hours");
        let primary = primary_match(&segments).unwrap();
        assert!(primary.starts_with("PERIODS"));
        assert!(primary.ends_with("hours"));
        let joined: String = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(joined, CONTRACT);
    }

    #[test]
    fn test_first_match_wins() {
        let segments = highlight(CONTRACT, "periods");
        let kinds: Vec<SegmentKind> = segments
            .iter()
            .filter(|s| s.kind != SegmentKind::Plain)
            .map(|s| s.kind)
            .collect();
        assert_eq!(kinds, vec![SegmentKind::Primary, SegmentKind::Match]);
        assert_eq!(primary_match(&segments), Some("PERIODS"));
    }

    #[test]
    fn test_no_match_returns_whole_text() {
        let segments = highlight(CONTRACT, "overtime");
        assert_eq!(segments, vec![Segment::new(CONTRACT, SegmentKind::Plain)]);
        assert_eq!(highlight(CONTRACT, ""), vec![Segment::new(CONTRACT, SegmentKind::Plain)]);
    }

    #[test]
    fn test_binary_only_document_view() {
        let file = UploadedFile::new("scan.pdf", "application/pdf", vec![1]);
        let doc = Document::normalize(&file, None, Some(vec![1])).unwrap();
        assert_eq!(
            render_document(&doc, "anything"),
            DocumentView::BinaryOnly {
                name: "scan.pdf".into()
            }
        );
    }
}
