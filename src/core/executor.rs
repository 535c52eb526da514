//! 同步模式执行
//!
//! 推送、拉取为一次性批处理并返回汇总报告；实时模式交给 [`LiveSyncEngine`]，直到取消。

use crate::config::{LiveOptions, SyncMode, SyncOptions};
use crate::core::live::{LiveReport, LiveSyncEngine};
use crate::core::validator::{check_inline_data, validate_options};
use crate::core::{RemoteKey, RemoteSession};
use crate::error::SyncError;
use crate::logging::LogSink;
use crate::storage::{display_path, FileSystem, RemoteConnector, ValueTree};
use reqwest::Url;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 推送报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushReport {
    pub start_time: i64,
    pub end_time: i64,
    pub files_matched: u32,
    pub files_written: u32,
    pub files_failed: u32,
    /// 内联数据是否已合并到根节点
    pub root_merged: bool,
    pub errors: Vec<String>,
}

impl PushReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// 拉取报告
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReport {
    pub start_time: i64,
    pub end_time: i64,
    /// 读取的远程路径
    pub remote_path: String,
    pub target: PathBuf,
}

/// 外部能力，由调用方注入
#[derive(Clone)]
pub struct Collaborators {
    pub fs: Arc<dyn FileSystem>,
    pub connector: Arc<dyn RemoteConnector>,
    pub log: Arc<dyn LogSink>,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Push(PushReport),
    Pull(PullReport),
    Live(LiveReport),
}

pub struct SyncModeExecutor {
    session: Arc<RemoteSession>,
    fs: Arc<dyn FileSystem>,
    log: Arc<dyn LogSink>,
}

impl SyncModeExecutor {
    pub fn new(session: Arc<RemoteSession>, fs: Arc<dyn FileSystem>, log: Arc<dyn LogSink>) -> Self {
        Self { session, fs, log }
    }

    /// 先把内联数据合并到根节点，再按文件系统给出的顺序逐个上传文件。
    /// 单个文件失败只记录，不中断批次。
    pub async fn push(
        &self,
        inline: Option<&ValueTree>,
        patterns: &[String],
    ) -> Result<PushReport, SyncError> {
        let mut report = PushReport {
            start_time: chrono::Utc::now().timestamp_millis(),
            end_time: 0,
            files_matched: 0,
            files_written: 0,
            files_failed: 0,
            root_merged: false,
            errors: Vec::new(),
        };

        // 非对象数据会整体替换远程根节点，写入前拒绝
        if let Some(error) = check_inline_data(inline) {
            self.log.error(&error.to_string());
            return Err(SyncError::Configuration(vec![error]));
        }

        if let Some(data) = inline {
            match self.session.write_subtree(&[], data).await {
                Ok(()) => {
                    report.root_merged = true;
                    self.log.info("内联数据已合并到根节点");
                }
                Err(e) => {
                    self.log.error(&e.to_string());
                    report.errors.push(e.to_string());
                }
            }
        }

        let paths = self
            .fs
            .match_paths(patterns)
            .await
            .map_err(|e| SyncError::transfer(patterns.join(","), e))?;
        report.files_matched = paths.len() as u32;
        self.log
            .info(&format!("匹配到 {} 个文件: {}", paths.len(), patterns.join(", ")));

        for path in &paths {
            match self.push_file(path).await {
                Ok(key) => {
                    report.files_written += 1;
                    self.log
                        .debug(&format!("已上传 {} -> {}", path.display(), key));
                }
                Err(e) => {
                    report.files_failed += 1;
                    self.log.warn(&e.to_string());
                    report.errors.push(e.to_string());
                }
            }
        }

        report.end_time = chrono::Utc::now().timestamp_millis();
        self.log.info(&format!(
            "推送完成: 成功 {}，失败 {}",
            report.files_written, report.files_failed
        ));
        Ok(report)
    }

    async fn push_file(&self, path: &Path) -> Result<RemoteKey, SyncError> {
        let target = path.display().to_string();
        let key = RemoteKey::from_path(path)
            .ok_or_else(|| SyncError::transfer(&target, "无法从文件名得到远程键"))?;
        let value = self
            .fs
            .read(path)
            .await
            .map_err(|e| SyncError::transfer(&target, e))?;
        self.session
            .write_subtree(std::slice::from_ref(&key), &value)
            .await?;
        Ok(key)
    }

    /// 读取远程节点并写入 `dest` 下的文件
    pub async fn pull(&self, source: Option<&str>, dest: &Path) -> Result<PullReport, SyncError> {
        let start_time = chrono::Utc::now().timestamp_millis();
        let (path, target) = pull_target(self.session.reference(), source, dest)?;

        let value = self.session.read_subtree_once(&path).await?;
        if value.is_null() {
            self.log
                .warn(&format!("远程节点 {} 没有数据", display_path(&path)));
        }

        self.fs
            .write(&target, &value)
            .await
            .map_err(|e| SyncError::transfer(target.display().to_string(), e))?;
        self.log.info(&format!(
            "已下载 {} -> {}",
            display_path(&path),
            target.display()
        ));

        Ok(PullReport {
            start_time,
            end_time: chrono::Utc::now().timestamp_millis(),
            remote_path: display_path(&path),
            target,
        })
    }

    /// 运行实时同步直到 `cancel` 触发
    pub async fn live(
        &self,
        token: &str,
        patterns: &[String],
        options: LiveOptions,
        cancel: CancellationToken,
    ) -> Result<LiveReport, SyncError> {
        let engine = LiveSyncEngine::new(
            self.session.clone(),
            self.fs.clone(),
            self.log.clone(),
            patterns.to_vec(),
            token.to_string(),
            options,
        );
        engine.run(cancel).await
    }
}

/// 拉取的远程路径和本地文件：`dest/<base><ext 或 .json>`。
/// 未指定 `source` 时读取根节点，文件名取根地址的最后一段，没有则为 `root`。
pub fn pull_target(
    reference: &Url,
    source: Option<&str>,
    dest: &Path,
) -> Result<(Vec<RemoteKey>, PathBuf), SyncError> {
    match source.map(str::trim).filter(|s| !s.is_empty()) {
        Some(source) => {
            let source = Path::new(source);
            let key = RemoteKey::from_path(source)
                .ok_or_else(|| SyncError::InvalidKey(source.display().to_string()))?;
            let ext = source
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("json");
            let file = dest.join(format!("{}.{}", key, ext));
            Ok((vec![key], file))
        }
        None => {
            let name = reference
                .path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
                .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_else(|_| s.to_string()))
                .unwrap_or_else(|| "root".to_string());
            Ok((Vec::new(), dest.join(format!("{}.json", name))))
        }
    }
}

/// 完整流程：校验配置 -> 连接 -> 认证 -> 按模式执行
///
/// 实时模式的认证由引擎在启动阶段完成，以便失败时体现为 `Faulted` 状态。
pub async fn run(
    options: &SyncOptions,
    collaborators: &Collaborators,
    cancel: CancellationToken,
) -> Result<RunOutcome, SyncError> {
    let log = &collaborators.log;

    if let Err(errors) = validate_options(options) {
        for error in &errors {
            log.error(&error.to_string());
        }
        return Err(SyncError::Configuration(errors));
    }
    let reference = options.reference.as_deref().unwrap_or_default();
    let token = options.token.as_deref().unwrap_or_default();

    let session = Arc::new(RemoteSession::connect(
        collaborators.connector.as_ref(),
        reference,
    )?);

    if options.mode != SyncMode::Live {
        if let Err(e) = session.authenticate(token).await {
            log.error(&e.to_string());
            return Err(e);
        }
    }

    let executor = SyncModeExecutor::new(session, collaborators.fs.clone(), log.clone());
    match options.mode {
        SyncMode::Push => executor
            .push(options.inline_data(), &options.file_patterns)
            .await
            .map(RunOutcome::Push),
        SyncMode::Pull => executor
            .pull(options.source.as_deref(), &options.dest_dir())
            .await
            .map(RunOutcome::Pull),
        SyncMode::Live => executor
            .live(token, &options.file_patterns, options.live.clone(), cancel)
            .await
            .map(RunOutcome::Live),
    }
}
