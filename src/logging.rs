//! 日志模块 - 核心日志通道、文件日志和大小管理

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志目录，默认 .firesync/logs
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
            dir: None,
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        }
    }

    /// 日志目录
    pub fn log_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".firesync").join("logs"))
    }
}

// ============ 核心日志通道 ============

/// 同步核心的日志出口，业务逻辑只通过它输出日志
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::DEBUG, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::INFO, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::WARN, message);
    }

    fn error(&self, message: &str) {
        self.log(Level::ERROR, message);
    }
}

/// 转发到 tracing
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "firesync", "{}", message),
            Level::WARN => tracing::warn!(target: "firesync", "{}", message),
            Level::INFO => tracing::info!(target: "firesync", "{}", message),
            Level::DEBUG => tracing::debug!(target: "firesync", "{}", message),
            _ => tracing::trace!(target: "firesync", "{}", message),
        }
    }
}

/// 一条日志记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
}

/// 把日志发送到通道，供宿主程序自行展示
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelSink {
    fn log(&self, level: Level, message: &str) {
        // 接收端已关闭时丢弃
        let _ = self.tx.send(LogRecord {
            level,
            message: message.to_string(),
        });
    }
}

// ============ 文件日志 ============

/// 带大小限制的日志写入器
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join("app.log");
        let max_size = (max_size_mb as u64) * 1024 * 1024;

        let writer = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
        // 超过限制的旧文件先轮转
        if Self::oversized(file_path, max_size) {
            Self::rotate_log(file_path)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(BufWriter::new(file))
    }

    fn oversized(file_path: &Path, max_size: u64) -> bool {
        fs::metadata(file_path)
            .map(|m| m.len() > max_size)
            .unwrap_or(false)
    }

    /// 轮转日志文件: app.log -> app.log.old
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");

        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }

        fs::rename(file_path, &backup_path)?;

        Ok(())
    }

    /// 关闭当前写入器，轮转后重新打开
    fn reopen(inner: &Mutex<Option<BufWriter<File>>>, file_path: &Path, max_size: u64) {
        let mut guard = match inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(mut w) = guard.take() {
            let _ = w.flush();
        }
        let _ = Self::rotate_log(file_path);
        if let Ok(new_writer) = Self::open_file(file_path, max_size) {
            *guard = Some(new_writer);
        }
    }
}

impl Clone for SizeRotatingWriter {
    fn clone(&self) -> Self {
        Self {
            file_path: self.file_path.clone(),
            max_size: self.max_size,
            writer: self.writer.clone(),
        }
    }
}

/// 日志写入器包装
pub struct LogWriter {
    inner: Arc<Mutex<Option<BufWriter<File>>>>,
    file_path: PathBuf,
    max_size: u64,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = {
            let mut guard = self
                .inner
                .lock()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
            let writer = guard
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Writer not available"))?;
            let n = writer.write(buf)?;
            writer.flush()?;
            n
        };

        if SizeRotatingWriter::oversized(&self.file_path, self.max_size) {
            SizeRotatingWriter::reopen(&self.inner, &self.file_path, self.max_size);
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer poisoned"))?;
        match guard.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for SizeRotatingWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        if Self::oversized(&self.file_path, self.max_size) {
            Self::reopen(&self.writer, &self.file_path, self.max_size);
        }

        LogWriter {
            inner: self.writer.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_level() {
        let mut config = LogConfig::default();
        assert_eq!(config.tracing_level(), Level::INFO);
        config.level = "WARN".to_string();
        assert_eq!(config.tracing_level(), Level::WARN);
        config.level = "bogus".to_string();
        assert_eq!(config.tracing_level(), Level::INFO);
    }

    #[test]
    fn test_channel_sink_forwards_records() {
        let (sink, mut rx) = ChannelSink::new();
        sink.warn("丢弃事件");
        let record = rx.try_recv().unwrap();
        assert_eq!(record.level, Level::WARN);
        assert_eq!(record.message, "丢弃事件");
    }

    #[test]
    fn test_rotating_writer_rotates_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("app.log");
        fs::write(&log_path, vec![b'x'; 2 * 1024 * 1024]).unwrap();

        let writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        let mut w = writer.make_writer();
        w.write_all(b"hello\n").unwrap();
        w.flush().unwrap();

        assert!(dir.path().join("app.log.old").exists());
        assert_eq!(fs::read_to_string(&log_path).unwrap(), "hello\n");
    }
}
