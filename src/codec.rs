//! 文件内容与数据树之间的转换
//!
//! `.json` 文件严格按 JSON 解析；其他扩展名优先尝试 JSON，失败时整体作为字符串叶子。
//! 写回时字符串叶子写入非 JSON 文件保持原文；若原文会被读成其他类型（如 `42`、`true`），
//! 改为写入带引号的 JSON 字符串，其余一律输出格式化 JSON。

use crate::storage::ValueTree;
use anyhow::{Context, Result};
use std::path::Path;

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// 文件字节 -> 数据树
pub fn decode(path: &Path, data: &[u8]) -> Result<ValueTree> {
    if is_json(path) {
        return serde_json::from_slice(data)
            .with_context(|| format!("JSON 解析失败: {}", path.display()));
    }

    match serde_json::from_slice::<ValueTree>(data) {
        Ok(value) => Ok(value),
        Err(_) => {
            let text = String::from_utf8(data.to_vec())
                .with_context(|| format!("文件不是 UTF-8 文本: {}", path.display()))?;
            Ok(ValueTree::String(text))
        }
    }
}

/// 数据树 -> 文件字节
pub fn encode(path: &Path, value: &ValueTree) -> Result<Vec<u8>> {
    if let (false, ValueTree::String(text)) = (is_json(path), value) {
        if serde_json::from_str::<ValueTree>(text).is_err() {
            return Ok(text.clone().into_bytes());
        }
    }

    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_file_roundtrip() {
        let path = Path::new("data/a.json");
        let value = json!({"one": {"foo": "bar"}, "three": ["first", "second"]});
        let bytes = encode(path, &value).unwrap();
        assert_eq!(decode(path, &bytes).unwrap(), value);
    }

    #[test]
    fn test_invalid_json_file_is_error() {
        assert!(decode(Path::new("a.json"), b"{not json").is_err());
    }

    #[test]
    fn test_markdown_becomes_string_leaf() {
        let path = Path::new("notes.md");
        let value = decode(path, b"# title\n- item\n").unwrap();
        assert_eq!(value, json!("# title\n- item\n"));
        assert_eq!(encode(path, &value).unwrap(), b"# title\n- item\n".to_vec());
    }

    #[test]
    fn test_text_that_looks_like_json_keeps_type() {
        let path = Path::new("notes.md");
        for text in ["42", "true", "null", "\"quoted\"", "[1, 2]", " 7 "] {
            let value = json!(text);
            let encoded = encode(path, &value).unwrap();
            assert_eq!(decode(path, &encoded).unwrap(), value, "text {:?}", text);
        }
        assert_eq!(encode(path, &json!("42")).unwrap(), b"\"42\"\n".to_vec());
    }

    #[test]
    fn test_structured_value_in_non_json_file() {
        let path = Path::new("notes.md");
        let value = decode(path, br#"{"x": 1}"#).unwrap();
        assert_eq!(value, json!({"x": 1}));

        let encoded = encode(path, &json!({"y": 2})).unwrap();
        assert_eq!(decode(path, &encoded).unwrap(), json!({"y": 2}));
    }
}
