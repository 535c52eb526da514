//! 进程内存储实现
//!
//! `MemoryStore` 实现远程存储语义（合并写入、子节点订阅），`MemoryFileSystem` 实现本地文件能力。
//! 两者都记录写入历史，供嵌入方做预演和断言。

use super::glob::{normalize, GlobPattern, PatternSet};
use super::tree::{get_at, merge_at};
use super::{CancelHandle, ChildChange, FileSystem, RemoteConnector, RemoteStore, ValueTree};
use crate::core::RemoteKey;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============ 远程存储 ============

/// 一次远程写入记录
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub path: Vec<String>,
    pub value: ValueTree,
}

struct Subscriber {
    id: u64,
    path: Vec<String>,
    tx: mpsc::Sender<ChildChange>,
}

#[derive(Default)]
struct StoreState {
    tree: ValueTree,
    writes: Vec<WriteRecord>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
    expected_token: Option<String>,
    fail_subscribe: bool,
    failing_keys: HashSet<String>,
}

/// 内存远程存储
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    /// 写入与通知在同一临界区内完成，订阅者按写入顺序收到变化
    order: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只接受指定令牌
    pub fn with_token(self, token: &str) -> Self {
        lock(&self.state).expected_token = Some(token.to_string());
        self
    }

    /// 初始数据
    pub fn with_tree(self, tree: ValueTree) -> Self {
        lock(&self.state).tree = tree;
        self
    }

    /// 订阅注册失败
    pub fn fail_subscribe(&self, fail: bool) {
        lock(&self.state).fail_subscribe = fail;
    }

    /// 写入第一段为 `key` 的路径时失败
    pub fn fail_writes_for(&self, key: &str) {
        lock(&self.state).failing_keys.insert(key.to_string());
    }

    /// 当前完整数据树
    pub fn tree(&self) -> ValueTree {
        lock(&self.state).tree.clone()
    }

    /// 通过 `write_subtree` 完成的写入
    pub fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.state).writes.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    /// 模拟连接断开：丢弃所有订阅，订阅方的接收通道随之关闭
    pub fn close_subscriptions(&self) {
        lock(&self.state).subscribers.clear();
    }

    /// 模拟其他客户端的写入：更新数据并通知订阅者，不计入写入记录
    pub async fn external_write(&self, path: &[&str], value: ValueTree) {
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        let _order = self.order.lock().await;
        let notifications = {
            let mut state = lock(&self.state);
            merge_at(&mut state.tree, &path, &value);
            Self::collect_notifications(&state, &path, &value)
        };
        Self::deliver(notifications).await;
    }

    fn apply_write(&self, path: &[RemoteKey], value: &ValueTree) -> Result<Vec<(mpsc::Sender<ChildChange>, ChildChange)>> {
        let path: Vec<String> = path.iter().map(|k| k.as_str().to_string()).collect();
        let mut state = lock(&self.state);

        let failing = match path.first() {
            Some(first) => state.failing_keys.contains(first),
            None => value
                .as_object()
                .map(|m| m.keys().any(|k| state.failing_keys.contains(k)))
                .unwrap_or(false),
        };
        if failing {
            anyhow::bail!("模拟写入失败: /{}", path.join("/"));
        }

        merge_at(&mut state.tree, &path, value);
        state.writes.push(WriteRecord {
            path: path.clone(),
            value: value.clone(),
        });
        Ok(Self::collect_notifications(&state, &path, value))
    }

    /// 计算一次写入影响到的订阅者及其子节点的新值
    fn collect_notifications(
        state: &StoreState,
        path: &[String],
        value: &ValueTree,
    ) -> Vec<(mpsc::Sender<ChildChange>, ChildChange)> {
        let mut out = Vec::new();
        for sub in &state.subscribers {
            let touched: Vec<String> = if path.len() > sub.path.len() {
                if path[..sub.path.len()] != sub.path[..] {
                    continue;
                }
                vec![path[sub.path.len()].clone()]
            } else {
                if sub.path[..path.len()] != path[..] {
                    continue;
                }
                // 写入点在订阅路径之上，取出落在订阅路径下的部分
                match get_at(value, &sub.path[path.len()..]) {
                    Some(ValueTree::Object(map)) => map.keys().cloned().collect(),
                    _ => Vec::new(),
                }
            };

            for child in touched {
                let mut child_path = sub.path.clone();
                child_path.push(child.clone());
                // 子节点被删除时不报告变化
                let Some(current) = get_at(&state.tree, &child_path) else {
                    continue;
                };
                let Ok(key) = RemoteKey::new(&child) else {
                    continue;
                };
                out.push((
                    sub.tx.clone(),
                    ChildChange {
                        key,
                        value: current.clone(),
                    },
                ));
            }
        }
        out
    }

    async fn deliver(notifications: Vec<(mpsc::Sender<ChildChange>, ChildChange)>) {
        for (tx, change) in notifications {
            // 订阅者已退出时忽略
            let _ = tx.send(change).await;
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn authenticate(&self, token: &str) -> Result<()> {
        let state = lock(&self.state);
        match &state.expected_token {
            Some(expected) if expected != token => Err(anyhow::anyhow!("令牌无效")),
            _ => Ok(()),
        }
    }

    async fn write_subtree(&self, path: &[RemoteKey], value: &ValueTree) -> Result<()> {
        let _order = self.order.lock().await;
        let notifications = self.apply_write(path, value)?;
        Self::deliver(notifications).await;
        Ok(())
    }

    async fn read_subtree_once(&self, path: &[RemoteKey]) -> Result<ValueTree> {
        let state = lock(&self.state);
        Ok(get_at(&state.tree, path.iter().map(|k| k.as_str()).collect::<Vec<_>>().as_slice())
            .cloned()
            .unwrap_or(ValueTree::Null))
    }

    async fn subscribe_children(
        &self,
        path: &[RemoteKey],
        tx: mpsc::Sender<ChildChange>,
    ) -> Result<CancelHandle> {
        let mut state = lock(&self.state);
        if state.fail_subscribe {
            anyhow::bail!("模拟订阅失败");
        }

        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber {
            id,
            path: path.iter().map(|k| k.as_str().to_string()).collect(),
            tx,
        });

        let shared = self.state.clone();
        Ok(CancelHandle::new(format!("memory-subscription-{}", id), move || {
            lock(&shared).subscribers.retain(|s| s.id != id);
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

impl RemoteConnector for MemoryStore {
    fn connect(&self, _reference: &Url) -> Result<Arc<dyn RemoteStore>> {
        Ok(Arc::new(self.clone()))
    }
}

// ============ 本地文件系统 ============

struct Watcher {
    id: u64,
    patterns: PatternSet,
    tx: mpsc::Sender<PathBuf>,
}

#[derive(Default)]
struct FsState {
    files: BTreeMap<PathBuf, ValueTree>,
    writes: Vec<(PathBuf, ValueTree)>,
    watchers: Vec<Watcher>,
    next_id: u64,
    fail_watch: bool,
    read_only: HashSet<PathBuf>,
}

/// 内存文件系统，路径按字典序排列
#[derive(Clone, Default)]
pub struct MemoryFileSystem {
    state: Arc<Mutex<FsState>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置文件，不触发监听
    pub fn with_file(self, path: impl AsRef<Path>, value: ValueTree) -> Self {
        lock(&self.state)
            .files
            .insert(Self::key(path.as_ref()), value);
        self
    }

    /// 监听注册失败
    pub fn fail_watch(&self, fail: bool) {
        lock(&self.state).fail_watch = fail;
    }

    /// 写入该路径时失败
    pub fn make_read_only(&self, path: impl AsRef<Path>) {
        lock(&self.state).read_only.insert(Self::key(path.as_ref()));
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<ValueTree> {
        lock(&self.state).files.get(&Self::key(path.as_ref())).cloned()
    }

    /// 通过 `write` 完成的写入
    pub fn writes(&self) -> Vec<(PathBuf, ValueTree)> {
        lock(&self.state).writes.clone()
    }

    pub fn watcher_count(&self) -> usize {
        lock(&self.state).watchers.len()
    }

    /// 模拟外部编辑：更新内容并通知监听者，返回收到通知的监听者数量
    pub async fn touch(&self, path: impl AsRef<Path>, value: ValueTree) -> usize {
        let key = Self::key(path.as_ref());
        let targets = {
            let mut state = lock(&self.state);
            state.files.insert(key.clone(), value);
            Self::interested(&state, &key)
        };
        Self::notify(targets, &key).await
    }

    fn key(path: &Path) -> PathBuf {
        PathBuf::from(normalize(&path.to_string_lossy()))
    }

    fn interested(state: &FsState, path: &Path) -> Vec<mpsc::Sender<PathBuf>> {
        state
            .watchers
            .iter()
            .filter(|w| w.patterns.is_match(path))
            .map(|w| w.tx.clone())
            .collect()
    }

    async fn notify(targets: Vec<mpsc::Sender<PathBuf>>, path: &Path) -> usize {
        let mut delivered = 0;
        for tx in targets {
            if tx.send(path.to_path_buf()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn compile(patterns: &[String]) -> Result<PatternSet> {
        let globs = patterns
            .iter()
            .map(|p| GlobPattern::new(p))
            .collect::<Result<Vec<_>>>()?;
        PatternSet::new(&globs)
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn match_paths(&self, patterns: &[String]) -> Result<Vec<PathBuf>> {
        let globs = Self::compile(patterns)?;
        let state = lock(&self.state);
        Ok(state
            .files
            .keys()
            .filter(|path| globs.is_match(path))
            .cloned()
            .collect())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(lock(&self.state).files.contains_key(&Self::key(path)))
    }

    async fn read(&self, path: &Path) -> Result<ValueTree> {
        lock(&self.state)
            .files
            .get(&Self::key(path))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("文件不存在: {}", path.display()))
    }

    async fn write(&self, path: &Path, value: &ValueTree) -> Result<()> {
        let key = Self::key(path);
        let targets = {
            let mut state = lock(&self.state);
            if state.read_only.contains(&key) {
                anyhow::bail!("文件只读: {}", path.display());
            }
            state.files.insert(key.clone(), value.clone());
            state.writes.push((key.clone(), value.clone()));
            Self::interested(&state, &key)
        };
        // 与真实文件监听一致：自身的写入同样会产生事件
        Self::notify(targets, &key).await;
        Ok(())
    }

    async fn watch(&self, patterns: &[String], tx: mpsc::Sender<PathBuf>) -> Result<CancelHandle> {
        let globs = Self::compile(patterns)?;
        let mut state = lock(&self.state);
        if state.fail_watch {
            anyhow::bail!("模拟监听失败");
        }

        let id = state.next_id;
        state.next_id += 1;
        state.watchers.push(Watcher {
            id,
            patterns: globs,
            tx,
        });

        let shared = self.state.clone();
        Ok(CancelHandle::new(format!("memory-watch-{}", id), move || {
            lock(&shared).watchers.retain(|w| w.id != id);
        }))
    }

    fn name(&self) -> &str {
        "memory-fs"
    }
}
