//! glob 模式匹配

use globset::{Glob, GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};

/// 编译后的 glob 模式
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    glob: Glob,
    matcher: GlobMatcher,
}

impl GlobPattern {
    /// 编译相对模式，如 `data/*.json`、`**/*.{json,md}`
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        Self::with_prefix("", pattern)
    }

    /// 编译带字面量前缀的模式（前缀不做通配解析）
    pub fn with_prefix(prefix: &str, pattern: &str) -> anyhow::Result<Self> {
        let pattern = normalize(pattern);
        let prefix = normalize(prefix);
        let full = if prefix.is_empty() {
            pattern.clone()
        } else {
            format!("{}/{}", globset::escape(prefix.trim_end_matches('/')), pattern)
        };

        // `*` 和 `?` 不跨越目录，`**` 匹配任意层级
        let glob = GlobBuilder::new(&full)
            .literal_separator(true)
            .build()
            .map_err(|e| anyhow::anyhow!("无效的 glob 模式 {}: {}", pattern, e))?;
        let matcher = glob.compile_matcher();
        Ok(Self {
            source: pattern,
            glob,
            matcher,
        })
    }

    pub fn is_match(&self, path: &Path) -> bool {
        self.matcher.is_match(normalize(&path.to_string_lossy()))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// 第一个通配段之前的目录，作为遍历起点
    pub fn literal_root(&self) -> PathBuf {
        let segments: Vec<&str> = self.source.split('/').collect();
        let mut root = Vec::new();
        // 最后一段是文件名，不计入目录
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if segment.contains(['*', '?', '[', '{']) {
                break;
            }
            root.push(*segment);
        }
        if root.is_empty() {
            PathBuf::from(".")
        } else if root == [""] {
            PathBuf::from("/")
        } else {
            PathBuf::from(root.join("/"))
        }
    }
}

/// 多个模式合并为一个集合，任一命中即匹配
#[derive(Debug, Clone)]
pub struct PatternSet {
    set: GlobSet,
}

impl PatternSet {
    pub fn new(patterns: &[GlobPattern]) -> anyhow::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(pattern.glob.clone());
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn is_match(&self, path: &Path) -> bool {
        self.set.is_match(normalize(&path.to_string_lossy()))
    }
}

/// 规范化路径分隔符（统一使用 /），去掉开头的 ./
pub fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut trimmed = path.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.to_string()
}
