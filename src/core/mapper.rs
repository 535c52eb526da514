use crate::error::SyncError;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// 远程根节点下的一级键：非空且不含 `/`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RemoteKey(String);

impl RemoteKey {
    pub fn new(key: impl Into<String>) -> Result<Self, SyncError> {
        let key = key.into();
        if key.is_empty() || key.contains('/') {
            return Err(SyncError::InvalidKey(key));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 文件名去掉最后一个扩展名
    pub fn from_path(path: &Path) -> Option<Self> {
        let stem = path.file_stem()?.to_str()?;
        Self::new(stem).ok()
    }
}

impl std::fmt::Display for RemoteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 远程键与本地文件的对应表，启动时构建一次，之后只读
#[derive(Debug, Default)]
pub struct FileKeyMapper {
    entries: HashMap<RemoteKey, PathBuf>,
    duplicates: Vec<PathBuf>,
}

impl FileKeyMapper {
    /// 同名文件只保留第一个，其余记入 `duplicates`
    pub fn build<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut mapper = Self::default();
        for path in paths {
            let path = path.into();
            let Some(key) = RemoteKey::from_path(&path) else {
                tracing::warn!("无法从文件名得到远程键: {}", path.display());
                continue;
            };
            match mapper.entries.get(&key) {
                Some(existing) => {
                    tracing::warn!(
                        "文件 {} 与 {} 对应同一个键 {}，忽略前者",
                        path.display(),
                        existing.display(),
                        key
                    );
                    mapper.duplicates.push(path);
                }
                None => {
                    mapper.entries.insert(key, path);
                }
            }
        }
        mapper
    }

    pub fn resolve_key(&self, key: &RemoteKey) -> Option<&Path> {
        self.entries.get(key).map(|p| p.as_path())
    }

    /// 路径对应的键，不要求路径在表中
    pub fn key_for(&self, path: &Path) -> Option<RemoteKey> {
        RemoteKey::from_path(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn duplicates(&self) -> &[PathBuf] {
        &self.duplicates
    }
}
