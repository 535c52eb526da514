//! 同步配置模块

use crate::logging::LogConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// 同步模式，启动时解析一次
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    #[serde(alias = "upload")]
    Push,
    #[serde(alias = "download")]
    Pull,
    #[serde(alias = "watch")]
    Live,
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "push" | "upload" => Ok(SyncMode::Push),
            "pull" | "download" => Ok(SyncMode::Pull),
            "live" | "watch" => Ok(SyncMode::Live),
            other => Err(format!("未知同步模式: {}", other)),
        }
    }
}

/// 实时同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveOptions {
    /// 本地事件合并窗口（毫秒），0 表示不合并
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// 回声抑制窗口（毫秒），0 表示关闭
    #[serde(default = "default_echo_window_ms")]
    pub echo_window_ms: u64,
    /// 事件通道容量
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_echo_window_ms() -> u64 {
    2000
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            echo_window_ms: default_echo_window_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// 同步任务配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    /// 远程根地址
    #[serde(default)]
    pub reference: Option<String>,
    /// 认证令牌
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub mode: SyncMode,
    /// 推送前合并到根节点的内联数据
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, alias = "files", alias = "src")]
    pub file_patterns: Vec<String>,
    /// 拉取目标目录，默认 ./
    #[serde(default, alias = "destinationDir")]
    pub dest: Option<PathBuf>,
    /// 拉取的远程键（可带扩展名），为空时拉取整个根节点
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub live: LiveOptions,
    #[serde(default)]
    pub log: LogConfig,
}

impl SyncOptions {
    /// 从 JSON 配置文件加载
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let options = serde_json::from_str::<SyncOptions>(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        Ok(options)
    }

    /// 拉取目标目录
    pub fn dest_dir(&self) -> PathBuf {
        self.dest.clone().unwrap_or_else(|| PathBuf::from("./"))
    }

    /// 内联数据（空对象视为无数据）
    pub fn inline_data(&self) -> Option<&Value> {
        match &self.data {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) if map.is_empty() => None,
            Some(v) => Some(v),
        }
    }
}
