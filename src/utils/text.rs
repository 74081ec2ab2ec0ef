//! # 文本截断与上游错误体摘要

use serde_json::Value;

/// 摘要的最大字符数
pub const SUMMARY_MAX_CHARS: usize = 200;

const ELLIPSIS: &str = "...";

/// 按字符截断，不会切断 UTF-8 字符
#[must_use]
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// 单行化并截断到 200 字符以内，超长时以 `...` 结尾
#[must_use]
pub fn trim_summary(s: &str) -> String {
    let single_line = s.trim().replace(['\r', '\n'], " ");
    if single_line.chars().count() <= SUMMARY_MAX_CHARS {
        return single_line;
    }
    let keep = SUMMARY_MAX_CHARS - ELLIPSIS.len();
    format!("{}{ELLIPSIS}", truncate_chars(&single_line, keep).trim_end())
}

/// 从上游错误体中提取人类可读信息
///
/// 依次尝试 `error.message`、`error.error_description`、`message`、
/// `error_description`，都没有时返回原始文本。
#[must_use]
pub fn summarize_upstream_error_body(body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    if let Ok(Value::Object(root)) = serde_json::from_slice::<Value>(body) {
        let nested = root.get("error").and_then(Value::as_object);
        let candidates = [
            nested.and_then(|e| e.get("message")),
            nested.and_then(|e| e.get("error_description")),
            root.get("message"),
            root.get("error_description"),
        ];
        if let Some(msg) = candidates
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .find(|s| !s.trim().is_empty())
        {
            return trim_summary(msg);
        }
    }
    trim_summary(&String::from_utf8_lossy(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(br#"{"error":{"message":"invalid key","error_description":"x"}}"#.as_slice(), "invalid key")]
    #[case(br#"{"error":{"message":" ","error_description":"token revoked"}}"#.as_slice(), "token revoked")]
    #[case(br#"{"message":"quota exhausted"}"#.as_slice(), "quota exhausted")]
    #[case(br#"{"error_description":"bad grant"}"#.as_slice(), "bad grant")]
    #[case(b"upstream\nexploded".as_slice(), "upstream exploded")]
    fn extracts_error_messages_in_order(#[case] body: &[u8], #[case] expected: &str) {
        assert_eq!(summarize_upstream_error_body(body), expected);
    }

    #[test]
    fn empty_body_yields_empty_summary() {
        assert_eq!(summarize_upstream_error_body(b""), "");
    }

    #[test]
    fn long_summary_is_bounded_single_line() {
        let long = "line\n".repeat(100);
        let out = trim_summary(&long);
        assert!(out.chars().count() <= SUMMARY_MAX_CHARS);
        assert!(out.ends_with("..."));
        assert!(!out.contains('\n'));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("你好世界", 2), "你好");
        assert_eq!(truncate_chars("ab", 5), "ab");
    }
}
