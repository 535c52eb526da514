use super::glob::{normalize, GlobPattern, PatternSet};
use super::{CancelHandle, FileSystem, ValueTree};
use crate::codec;
use anyhow::Result;
use async_trait::async_trait;
use notify::event::{CreateKind, ModifyKind};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// 写入时使用的临时文件后缀，监听时忽略
const TEMP_SUFFIX: &str = ".firesync.tmp";

pub struct LocalFileSystem {
    base_path: PathBuf,
    name: String,
}

impl LocalFileSystem {
    /// 以 `path` 为相对模式和相对路径的基准目录
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }
        // 规范化，保证与监听事件中的路径一致
        let base_path = std::fs::canonicalize(path)?;
        let name = format!("local:{}", base_path.display());
        Ok(Self { base_path, name })
    }

    /// 以当前工作目录为基准
    pub fn current_dir() -> Result<Self> {
        Self::new(std::env::current_dir()?)
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    /// 模式统一转换为绝对路径匹配
    fn compile(&self, patterns: &[String]) -> Result<PatternSet> {
        let globs = patterns
            .iter()
            .map(|p| {
                if Path::new(p).is_absolute() {
                    GlobPattern::new(p)
                } else {
                    GlobPattern::with_prefix(&self.base_path.to_string_lossy(), p)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        PatternSet::new(&globs)
    }

    /// 每个模式的遍历起点（去重）
    fn roots(&self, patterns: &[String]) -> Result<Vec<PathBuf>> {
        let mut roots = BTreeSet::new();
        for pattern in patterns {
            let root = GlobPattern::new(pattern)?.literal_root();
            if root == Path::new(".") {
                roots.insert(self.base_path.clone());
            } else {
                roots.insert(self.resolve_path(&root));
            }
        }
        Ok(roots.into_iter().collect())
    }

    fn temp_path(full_path: &Path) -> PathBuf {
        let file_name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        full_path.with_file_name(format!(".{}{}", file_name, TEMP_SUFFIX))
    }
}

/// 监听事件中需要上报的类型：新建文件、内容修改、重命名到目标路径
fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
    )
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn match_paths(&self, patterns: &[String]) -> Result<Vec<PathBuf>> {
        let globs = self.compile(patterns)?;
        let roots = self.roots(patterns)?;

        // 使用 spawn_blocking 避免阻塞 async runtime
        let matched = tokio::task::spawn_blocking(move || {
            let mut matched = BTreeSet::new();
            for root in roots {
                if !root.exists() {
                    continue;
                }
                for entry in WalkDir::new(&root)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let path = entry.path();
                    if globs.is_match(path) {
                        matched.insert(path.to_path_buf());
                    }
                }
            }
            matched
        })
        .await?;

        Ok(matched.into_iter().collect())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(fs::try_exists(self.resolve_path(path)).await?)
    }

    async fn read(&self, path: &Path) -> Result<ValueTree> {
        let full_path = self.resolve_path(path);
        let data = fs::read(&full_path).await?;
        codec::decode(&full_path, &data)
    }

    async fn write(&self, path: &Path, value: &ValueTree) -> Result<()> {
        let full_path = self.resolve_path(path);
        let data = codec::encode(&full_path, value)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let temp_path = Self::temp_path(&full_path);
        fs::write(&temp_path, data).await?;
        fs::rename(&temp_path, &full_path).await?;

        Ok(())
    }

    async fn watch(&self, patterns: &[String], tx: mpsc::Sender<PathBuf>) -> Result<CancelHandle> {
        let globs = self.compile(patterns)?;
        let roots: Vec<PathBuf> = self
            .roots(patterns)?
            .into_iter()
            .filter(|r| r.exists())
            .collect();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if !is_change(&event.kind) {
                        return;
                    }
                    for path in event.paths {
                        if normalize(&path.to_string_lossy()).ends_with(TEMP_SUFFIX) {
                            continue;
                        }
                        if globs.is_match(&path) && path.is_file() {
                            // 通知线程不在 runtime 内，可以阻塞发送
                            let _ = tx.blocking_send(path);
                        }
                    }
                }
                Err(e) => tracing::warn!("文件监听错误: {}", e),
            },
            notify::Config::default(),
        )?;

        for root in &roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            tracing::debug!("开始监听目录: {}", root.display());
        }

        let label = format!("{} watch {}", self.name, patterns.join(","));
        Ok(CancelHandle::new(label, move || {
            for root in &roots {
                if let Err(e) = watcher.unwatch(root) {
                    tracing::debug!("取消监听失败 {}: {}", root.display(), e);
                }
            }
            drop(watcher);
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
