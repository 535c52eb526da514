pub mod firebase;
pub mod glob;
pub mod local;
pub mod memory;
pub mod tree;

use crate::core::RemoteKey;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use firebase::RestStore;
pub use local::LocalFileSystem;
pub use memory::{MemoryFileSystem, MemoryStore};

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- 认证、写入等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- 整树读取
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 与远程存储交换、与文件互相转换的数据树
pub type ValueTree = serde_json::Value;

/// 远程根节点下某个直接子节点的变化
#[derive(Debug, Clone, PartialEq)]
pub struct ChildChange {
    pub key: RemoteKey,
    pub value: ValueTree,
}

/// 监听 / 订阅句柄，取消或丢弃时释放，且只释放一次
pub struct CancelHandle {
    label: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CancelHandle {
    pub fn new(label: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label: label.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// 立即释放
    pub fn cancel(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            tracing::debug!("释放句柄: {}", self.label);
            release();
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("label", &self.label)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// 本地文件系统能力
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// 按模式列出匹配的文件，顺序对同一文件系统状态是确定的
    async fn match_paths(&self, patterns: &[String]) -> Result<Vec<PathBuf>>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// 读取文件并解析为数据树
    async fn read(&self, path: &Path) -> Result<ValueTree>;

    /// 序列化数据树并覆盖写入，必要时创建父目录
    async fn write(&self, path: &Path, value: &ValueTree) -> Result<()>;

    /// 监听匹配模式的文件变化，变化的路径发送到 `tx`
    async fn watch(&self, patterns: &[String], tx: mpsc::Sender<PathBuf>) -> Result<CancelHandle>;

    /// 获取名称（用于日志）
    fn name(&self) -> &str;
}

/// 远程键值树存储能力，路径相对于连接时的根地址
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<()>;

    /// 更新语义合并写入
    async fn write_subtree(&self, path: &[RemoteKey], value: &ValueTree) -> Result<()>;

    /// 一次性读取路径处的完整子树
    async fn read_subtree_once(&self, path: &[RemoteKey]) -> Result<ValueTree>;

    /// 订阅路径下直接子节点的变化，按到达顺序发送到 `tx`
    async fn subscribe_children(
        &self,
        path: &[RemoteKey],
        tx: mpsc::Sender<ChildChange>,
    ) -> Result<CancelHandle>;

    /// 获取名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据根地址创建远程存储
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, reference: &Url) -> Result<Arc<dyn RemoteStore>>;
}

/// 按地址协议选择存储实现：http/https 使用 REST，memory 使用进程内存储
#[derive(Debug, Default, Clone)]
pub struct DefaultConnector;

impl RemoteConnector for DefaultConnector {
    fn connect(&self, reference: &Url) -> Result<Arc<dyn RemoteStore>> {
        match reference.scheme() {
            "http" | "https" => {
                tracing::info!("初始化 REST 存储: {}", reference);
                Ok(Arc::new(RestStore::new(reference.clone())?) as Arc<dyn RemoteStore>)
            }
            "memory" => {
                tracing::info!("初始化内存存储: {}", reference);
                Ok(Arc::new(MemoryStore::new()) as Arc<dyn RemoteStore>)
            }
            other => Err(anyhow::anyhow!("不支持的地址协议: {}", other)),
        }
    }
}

/// 远程路径的展示形式
pub fn display_path(path: &[RemoteKey]) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }
}
