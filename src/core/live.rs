//! 实时双向同步引擎
//!
//! 启动时建立键与文件的映射，注册文件监听和远程根节点的子节点订阅，之后由两个
//! 相互独立的顺序任务分别处理本地事件（上传）和远程事件（写回文件），直到取消。

use crate::config::LiveOptions;
use crate::core::echo::{Direction, EchoGuard};
use crate::core::{FileKeyMapper, RemoteSession};
use crate::error::SyncError;
use crate::logging::LogSink;
use crate::storage::{CancelHandle, ChildChange, FileSystem};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// 引擎状态：Starting -> Watching -> (Cancelled | Faulted)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Watching,
    Cancelled,
    /// 仅在启动阶段失败时进入
    Faulted(String),
}

/// 实时同步报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveReport {
    pub start_time: i64,
    pub end_time: i64,
    pub files_mapped: u32,
    pub uploads: u64,
    pub downloads: u64,
    /// 无法对应到文件或键的事件
    pub dropped: u64,
    pub echoes_suppressed: u64,
    pub failures: u64,
    /// 远程订阅在运行期间断开且未能恢复，之后只上传本地变化
    pub remote_lost: bool,
}

#[derive(Debug, Default)]
struct LiveStats {
    uploads: AtomicU64,
    downloads: AtomicU64,
    dropped: AtomicU64,
    echoes_suppressed: AtomicU64,
    failures: AtomicU64,
    remote_lost: AtomicBool,
}

impl LiveStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// 启动阶段的产物
struct Started {
    mapper: Arc<FileKeyMapper>,
    watch: CancelHandle,
    subscription: CancelHandle,
    local_rx: mpsc::Receiver<PathBuf>,
    remote_rx: mpsc::Receiver<ChildChange>,
}

/// 两个工作任务共享的上下文
struct SyncContext {
    session: Arc<RemoteSession>,
    fs: Arc<dyn FileSystem>,
    log: Arc<dyn LogSink>,
    mapper: Arc<FileKeyMapper>,
    echo: EchoGuard,
    stats: Arc<LiveStats>,
}

pub struct LiveSyncEngine {
    session: Arc<RemoteSession>,
    fs: Arc<dyn FileSystem>,
    log: Arc<dyn LogSink>,
    patterns: Vec<String>,
    token: String,
    options: LiveOptions,
    state_tx: watch::Sender<EngineState>,
    stats: Arc<LiveStats>,
}

impl LiveSyncEngine {
    pub fn new(
        session: Arc<RemoteSession>,
        fs: Arc<dyn FileSystem>,
        log: Arc<dyn LogSink>,
        patterns: Vec<String>,
        token: String,
        options: LiveOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Starting);
        Self {
            session,
            fs,
            log,
            patterns,
            token,
            options,
            state_tx,
            stats: Arc::new(LiveStats::default()),
        }
    }

    /// 订阅状态变化
    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: EngineState) {
        self.log.debug(&format!("实时同步状态: {:?}", state));
        self.state_tx.send_replace(state);
    }

    /// 运行直到 `cancel` 触发。启动失败时进入 `Faulted` 并返回错误，已注册的句柄全部释放。
    pub async fn run(self, cancel: CancellationToken) -> Result<LiveReport, SyncError> {
        let start_time = chrono::Utc::now().timestamp_millis();

        let started = tokio::select! {
            _ = cancel.cancelled() => {
                self.log.info("实时同步在启动阶段被取消");
                self.set_state(EngineState::Cancelled);
                return Ok(self.report(start_time, 0));
            }
            result = self.start() => result,
        };
        let Started {
            mapper,
            watch,
            subscription,
            local_rx,
            remote_rx,
        } = match started {
            Ok(started) => started,
            Err(e) => {
                self.log.error(&format!("实时同步启动失败: {}", e));
                self.set_state(EngineState::Faulted(e.to_string()));
                return Err(e);
            }
        };

        let files_mapped = mapper.len() as u32;
        let context = Arc::new(SyncContext {
            session: self.session.clone(),
            fs: self.fs.clone(),
            log: self.log.clone(),
            mapper,
            echo: EchoGuard::new(Duration::from_millis(self.options.echo_window_ms)),
            stats: self.stats.clone(),
        });

        self.set_state(EngineState::Watching);
        self.log.info(&format!(
            "开始实时同步: {} 个文件，远程 {}",
            files_mapped,
            self.session.reference()
        ));

        let debounce = Duration::from_millis(self.options.debounce_ms);
        tokio::spawn(local_worker(
            context.clone(),
            local_rx,
            cancel.clone(),
            debounce,
        ));
        tokio::spawn(remote_worker(context, remote_rx, cancel.clone()));

        cancel.cancelled().await;

        // 先释放监听和订阅，再返回
        watch.cancel();
        subscription.cancel();
        self.set_state(EngineState::Cancelled);

        let report = self.report(start_time, files_mapped);
        self.log.info(&format!(
            "实时同步已停止: 上传 {}，下载 {}，失败 {}",
            report.uploads, report.downloads, report.failures
        ));
        Ok(report)
    }

    async fn start(&self) -> Result<Started, SyncError> {
        if !self.session.is_authenticated() {
            self.session.authenticate(&self.token).await?;
        }

        let paths = self
            .fs
            .match_paths(&self.patterns)
            .await
            .map_err(|e| SyncError::WatchSetup(format!("{:#}", e)))?;
        let mapper = Arc::new(FileKeyMapper::build(paths));

        let capacity = self.options.channel_capacity.max(1);
        let (local_tx, local_rx) = mpsc::channel(capacity);
        let watch = self
            .fs
            .watch(&self.patterns, local_tx)
            .await
            .map_err(|e| SyncError::WatchSetup(format!("{:#}", e)))?;
        let log = self.log.clone();
        let watch = scopeguard::guard(watch, move |handle| {
            log.warn(&format!("订阅失败，释放文件监听: {}", handle.label()));
            handle.cancel();
        });

        let (remote_tx, remote_rx) = mpsc::channel(capacity);
        let subscription = self.session.subscribe_child_changes(&[], remote_tx).await?;

        Ok(Started {
            mapper,
            watch: scopeguard::ScopeGuard::into_inner(watch),
            subscription,
            local_rx,
            remote_rx,
        })
    }

    fn report(&self, start_time: i64, files_mapped: u32) -> LiveReport {
        let stats = &self.stats;
        LiveReport {
            start_time,
            end_time: chrono::Utc::now().timestamp_millis(),
            files_mapped,
            uploads: stats.uploads.load(Ordering::Relaxed),
            downloads: stats.downloads.load(Ordering::Relaxed),
            dropped: stats.dropped.load(Ordering::Relaxed),
            echoes_suppressed: stats.echoes_suppressed.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
            remote_lost: stats.remote_lost.load(Ordering::Relaxed),
        }
    }
}

impl SyncContext {
    /// 本地文件 -> 远程 `[key]`
    async fn upload(&self, path: &Path) {
        let Some(key) = self.mapper.key_for(path) else {
            LiveStats::bump(&self.stats.dropped);
            self.log
                .warn(&format!("无法从文件名得到远程键: {}", path.display()));
            return;
        };

        let value = match self.fs.read(path).await {
            Ok(value) => value,
            Err(e) => {
                LiveStats::bump(&self.stats.failures);
                self.log
                    .warn(&format!("读取文件失败 {}: {:#}", path.display(), e));
                return;
            }
        };

        if self.echo.is_echo(&key, Direction::Download, &value) {
            LiveStats::bump(&self.stats.echoes_suppressed);
            self.log.debug(&format!("跳过回写产生的文件事件: {}", key));
            return;
        }

        self.echo.record(&key, Direction::Upload, &value);
        match self
            .session
            .write_subtree(std::slice::from_ref(&key), &value)
            .await
        {
            Ok(()) => {
                LiveStats::bump(&self.stats.uploads);
                self.log
                    .info(&format!("已上传 {} -> {}", path.display(), key));
            }
            Err(e) => {
                self.echo.forget(&key, Direction::Upload);
                LiveStats::bump(&self.stats.failures);
                self.log.warn(&e.to_string());
            }
        }
    }

    /// 远程子节点 -> 对应的本地文件
    async fn download(&self, change: ChildChange) {
        let ChildChange { key, value } = change;
        let Some(path) = self.mapper.resolve_key(&key) else {
            LiveStats::bump(&self.stats.dropped);
            self.log.debug(&format!("远程键 {} 没有对应的文件，忽略", key));
            return;
        };

        if self.echo.is_echo(&key, Direction::Upload, &value) {
            LiveStats::bump(&self.stats.echoes_suppressed);
            self.log.debug(&format!("跳过上传产生的远程事件: {}", key));
            return;
        }

        self.echo.record(&key, Direction::Download, &value);
        match self.fs.write(path, &value).await {
            Ok(()) => {
                LiveStats::bump(&self.stats.downloads);
                self.log
                    .info(&format!("已下载 {} -> {}", key, path.display()));
            }
            Err(e) => {
                self.echo.forget(&key, Direction::Download);
                LiveStats::bump(&self.stats.failures);
                self.log
                    .warn(&format!("写入文件失败 {}: {:#}", path.display(), e));
            }
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// 本地事件按顺序上传；合并窗口内同一路径只上传一次，保持首次出现的顺序
async fn local_worker(
    context: Arc<SyncContext>,
    mut rx: mpsc::Receiver<PathBuf>,
    cancel: CancellationToken,
    debounce: Duration,
) {
    let mut pending: Vec<PathBuf> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = wait_deadline(deadline) => {
                deadline = None;
                for path in std::mem::take(&mut pending) {
                    if cancel.is_cancelled() {
                        return;
                    }
                    context.upload(&path).await;
                }
            }
            event = rx.recv() => match event {
                Some(path) if debounce.is_zero() => context.upload(&path).await,
                Some(path) => {
                    if !pending.contains(&path) {
                        pending.push(path);
                    }
                    deadline.get_or_insert_with(|| Instant::now() + debounce);
                }
                None => {
                    context.log.warn("文件监听已结束");
                    break;
                }
            },
        }
    }
}

/// 远程事件按到达顺序写回文件
async fn remote_worker(
    context: Arc<SyncContext>,
    mut rx: mpsc::Receiver<ChildChange>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            change = rx.recv() => match change {
                Some(change) => context.download(change).await,
                None => {
                    if !cancel.is_cancelled() {
                        context.stats.remote_lost.store(true, Ordering::Relaxed);
                        context.log.error("远程订阅已断开，不再接收远程变化");
                    }
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::logging::TracingSink;
    use crate::storage::{LocalFileSystem, MemoryFileSystem, MemoryStore, RemoteConnector, ValueTree};
    use serde_json::json;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("等待条件超时");
    }

    fn engine(store: &MemoryStore, fs: &MemoryFileSystem, options: LiveOptions) -> LiveSyncEngine {
        engine_on(store, Arc::new(fs.clone()), options)
    }

    fn engine_on(store: &MemoryStore, fs: Arc<dyn FileSystem>, options: LiveOptions) -> LiveSyncEngine {
        let session = RemoteSession::connect(store as &dyn RemoteConnector, "memory://live")
            .unwrap();
        LiveSyncEngine::new(
            Arc::new(session),
            fs,
            Arc::new(TracingSink),
            vec!["data/*".to_string()],
            "secret".to_string(),
            options,
        )
    }

    async fn start(
        engine: LiveSyncEngine,
    ) -> (
        CancellationToken,
        tokio::task::JoinHandle<Result<LiveReport, SyncError>>,
    ) {
        let cancel = CancellationToken::new();
        let mut state = engine.state();
        let handle = tokio::spawn(engine.run(cancel.clone()));
        state
            .wait_for(|s| *s == EngineState::Watching)
            .await
            .unwrap();
        (cancel, handle)
    }

    #[tokio::test]
    async fn test_local_change_uploads_once() {
        let store = MemoryStore::new();
        let fs = MemoryFileSystem::new().with_file("data/notes.md", json!("draft"));
        let (cancel, handle) = start(engine(&store, &fs, LiveOptions::default())).await;

        assert_eq!(fs.touch("data/notes.md", json!("final")).await, 1);
        wait_until(|| !store.writes().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].path, vec!["notes".to_string()]);
        assert_eq!(writes[0].value, json!("final"));
        // 上传引起的远程事件被识别为回声，不会写回文件
        assert!(fs.writes().is_empty());

        cancel.cancel();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.uploads, 1);
        assert_eq!(report.echoes_suppressed, 1);
        assert_eq!(report.files_mapped, 1);
        assert!(!report.remote_lost);
    }

    #[tokio::test]
    async fn test_unmapped_remote_change_is_dropped() {
        let store = MemoryStore::new();
        let fs = MemoryFileSystem::new().with_file("data/a.json", json!({"x": 1}));
        let (cancel, handle) = start(engine(&store, &fs, LiveOptions::default())).await;

        store.external_write(&["notes"], json!("remote")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fs.writes().is_empty());

        cancel.cancel();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.failures, 0);
    }

    #[tokio::test]
    async fn test_remote_change_writes_mapped_file() {
        let store = MemoryStore::new();
        let fs = MemoryFileSystem::new().with_file("data/a.json", json!({"x": 1}));
        let (cancel, handle) = start(engine(&store, &fs, LiveOptions::default())).await;

        store.external_write(&["a"], json!({"x": 2})).await;
        wait_until(|| fs.file("data/a.json") == Some(json!({"x": 2}))).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        // 写回文件产生的监听事件不会再上传
        assert!(store.writes().is_empty());

        cancel.cancel();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.downloads, 1);
        assert_eq!(report.uploads, 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_handles() {
        let store = MemoryStore::new();
        let fs = MemoryFileSystem::new().with_file("data/a.json", json!({"x": 1}));
        let engine = engine(&store, &fs, LiveOptions::default());
        let state = engine.state();
        let (cancel, handle) = start(engine).await;
        assert_eq!(fs.watcher_count(), 1);
        assert_eq!(store.subscriber_count(), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(*state.borrow(), EngineState::Cancelled);
        assert_eq!(fs.watcher_count(), 0);
        assert_eq!(store.subscriber_count(), 0);

        assert_eq!(fs.touch("data/a.json", json!({"x": 5})).await, 0);
        store.external_write(&["a"], json!({"x": 9})).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.writes().is_empty());
        assert!(fs.writes().is_empty());
    }

    #[tokio::test]
    async fn test_authentication_failure_faults_without_registering() {
        let store = MemoryStore::new().with_token("other");
        let fs = MemoryFileSystem::new().with_file("data/a.json", json!(1));
        let engine = engine(&store, &fs, LiveOptions::default());
        let state = engine.state();

        let err = engine.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));
        assert!(matches!(*state.borrow(), EngineState::Faulted(_)));
        assert_eq!(fs.watcher_count(), 0);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_setup_failures_release_registered_handles() {
        let store = MemoryStore::new();
        store.fail_subscribe(true);
        let fs = MemoryFileSystem::new().with_file("data/a.json", json!(1));
        let err = engine(&store, &fs, LiveOptions::default())
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SubscriptionSetup(_)));
        assert_eq!(fs.watcher_count(), 0);

        let store = MemoryStore::new();
        let fs = MemoryFileSystem::new();
        fs.fail_watch(true);
        let err = engine(&store, &fs, LiveOptions::default())
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::WatchSetup(_)));
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_debounce_collapses_bursts() {
        let store = MemoryStore::new();
        let fs = MemoryFileSystem::new()
            .with_file("data/a.json", json!(0))
            .with_file("data/b.json", json!(0));
        let options = LiveOptions {
            debounce_ms: 150,
            ..Default::default()
        };
        let (cancel, handle) = start(engine(&store, &fs, options)).await;

        fs.touch("data/b.json", json!(1)).await;
        fs.touch("data/a.json", json!(1)).await;
        fs.touch("data/b.json", json!(2)).await;
        wait_until(|| store.writes().len() >= 2).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let writes = store.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].path, vec!["b".to_string()]);
        assert_eq!(writes[0].value, json!(2));
        assert_eq!(writes[1].path, vec!["a".to_string()]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disabled_echo_guard_writes_back() {
        let store = MemoryStore::new();
        let fs = MemoryFileSystem::new().with_file("data/a.json", json!({"x": 1}));
        fs.make_read_only("data/a.json");
        let options = LiveOptions {
            echo_window_ms: 0,
            ..Default::default()
        };
        let (cancel, handle) = start(engine(&store, &fs, options)).await;

        fs.touch("data/a.json", json!({"x": 2})).await;
        wait_until(|| !store.writes().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.uploads, 1);
        assert_eq!(report.echoes_suppressed, 0);
        // 回声未被抑制，写回只读文件失败但不会中断同步
        assert_eq!(report.failures, 1);
    }

    #[tokio::test]
    async fn test_lost_subscription_is_reported() {
        let store = MemoryStore::new();
        let fs = MemoryFileSystem::new().with_file("data/a.json", json!({"x": 1}));
        let (cancel, handle) = start(engine(&store, &fs, LiveOptions::default())).await;

        store.close_subscriptions();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 本地变化仍然上传
        fs.touch("data/a.json", json!({"x": 2})).await;
        wait_until(|| !store.writes().is_empty()).await;

        cancel.cancel();
        let report = handle.await.unwrap().unwrap();
        assert!(report.remote_lost);
        assert_eq!(report.uploads, 1);
    }

    /// 在临时目录中准备 `data/` 下的文件
    fn local_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        for (name, content) in files {
            std::fs::write(dir.path().join("data").join(name), content).unwrap();
        }
        dir
    }

    fn read_local(dir: &tempfile::TempDir, name: &str) -> Option<ValueTree> {
        let path = dir.path().join("data").join(name);
        let data = std::fs::read(&path).ok()?;
        codec::decode(&path, &data).ok()
    }

    #[tokio::test]
    async fn test_remote_changes_reach_disk_without_echo_upload() {
        let dir = local_dir(&[("notes.md", "draft"), ("a.json", r#"{"x": 1}"#)]);
        let fs = LocalFileSystem::new(dir.path()).unwrap();
        let store = MemoryStore::new();
        let (cancel, handle) =
            start(engine_on(&store, Arc::new(fs), LiveOptions::default())).await;

        // 文本文件收到看起来像数字的字符串
        store.external_write(&["notes"], json!("42")).await;
        store.external_write(&["a"], json!({"x": 2})).await;

        wait_until(|| {
            read_local(&dir, "notes.md") == Some(json!("42"))
                && read_local(&dir, "a.json") == Some(json!({"x": 2}))
        })
        .await;
        // 等待写文件产生的监听事件处理完
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(store.writes().is_empty());

        cancel.cancel();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.downloads, 2);
        assert_eq!(report.uploads, 0);
        assert_eq!(report.failures, 0);
    }

    #[tokio::test]
    async fn test_local_edit_on_disk_uploads_once() {
        let dir = local_dir(&[("a.json", r#"{"x": 1}"#), ("notes.md", "draft")]);
        let fs = LocalFileSystem::new(dir.path()).unwrap();
        let store = MemoryStore::new();
        let (cancel, handle) =
            start(engine_on(&store, Arc::new(fs), LiveOptions::default())).await;

        std::fs::write(dir.path().join("data/a.json"), r#"{"x": 5}"#).unwrap();
        wait_until(|| !store.writes().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(800)).await;

        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].path, vec!["a".to_string()]);
        assert_eq!(writes[0].value, json!({"x": 5}));
        // 上传引起的远程事件不会改写文件
        assert_eq!(read_local(&dir, "a.json"), Some(json!({"x": 5})));

        cancel.cancel();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.uploads, 1);
        assert_eq!(report.downloads, 0);
        assert_eq!(report.files_mapped, 2);
    }
}
