//! 回声抑制
//!
//! 引擎写出的数据会以事件形式回到自己这里（写远程触发订阅，写文件触发监听）。
//! 写出前按键和方向记下内容摘要，窗口内收到摘要相同的事件即视为回声并丢弃。
//! 同一次写出可能产生多个事件（如重命名），命中后记录保留到过期；
//! 收到内容不同的事件说明已有新的修改，记录随即作废。

use crate::core::RemoteKey;
use crate::storage::ValueTree;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// 引擎写出的方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// 本地 -> 远程
    Upload,
    /// 远程 -> 本地
    Download,
}

struct Mark {
    digest: String,
    expires: Instant,
}

pub struct EchoGuard {
    window: Duration,
    marks: Mutex<HashMap<(RemoteKey, Direction), Mark>>,
}

/// 数据树内容摘要（blake3，取前 32 位十六进制）
pub fn digest(value: &ValueTree) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    blake3::hash(&bytes).to_hex()[..32].to_string()
}

impl EchoGuard {
    /// 窗口为 0 时关闭抑制
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            marks: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.window.is_zero()
    }

    fn marks(&self) -> MutexGuard<'_, HashMap<(RemoteKey, Direction), Mark>> {
        match self.marks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 写出之前调用
    pub fn record(&self, key: &RemoteKey, direction: Direction, value: &ValueTree) {
        if !self.is_enabled() {
            return;
        }
        self.marks().insert(
            (key.clone(), direction),
            Mark {
                digest: digest(value),
                expires: Instant::now() + self.window,
            },
        );
    }

    /// 写出失败时撤销记录
    pub fn forget(&self, key: &RemoteKey, direction: Direction) {
        self.marks().remove(&(key.clone(), direction));
    }

    /// 事件是否为 `direction` 方向写出产生的回声
    pub fn is_echo(&self, key: &RemoteKey, direction: Direction, value: &ValueTree) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let mut marks = self.marks();
        let slot = (key.clone(), direction);
        let Some(mark) = marks.get(&slot) else {
            return false;
        };
        if mark.expires <= Instant::now() || mark.digest != digest(value) {
            marks.remove(&slot);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(s: &str) -> RemoteKey {
        RemoteKey::new(s).unwrap()
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(digest(&json!({"a": 1})), digest(&json!({"a": 1})));
        assert_ne!(digest(&json!({"a": 1})), digest(&json!({"a": 2})));
        assert_eq!(digest(&json!(null)).len(), 32);
    }

    #[tokio::test]
    async fn test_repeated_echo_suppressed_until_new_value() {
        let guard = EchoGuard::new(Duration::from_secs(2));
        let value = json!({"x": 1});
        guard.record(&key("a"), Direction::Upload, &value);

        assert!(!guard.is_echo(&key("a"), Direction::Download, &value));
        assert!(guard.is_echo(&key("a"), Direction::Upload, &value));
        // 同一次写出的重复事件
        assert!(guard.is_echo(&key("a"), Direction::Upload, &value));

        // 出现新内容后，改回原内容属于真实修改
        assert!(!guard.is_echo(&key("a"), Direction::Upload, &json!({"x": 2})));
        assert!(!guard.is_echo(&key("a"), Direction::Upload, &value));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_expires() {
        let guard = EchoGuard::new(Duration::from_millis(100));
        let value = json!("text");
        guard.record(&key("a"), Direction::Download, &value);
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!guard.is_echo(&key("a"), Direction::Download, &value));
    }

    #[tokio::test]
    async fn test_disabled_and_forget() {
        let off = EchoGuard::new(Duration::ZERO);
        off.record(&key("a"), Direction::Upload, &json!(1));
        assert!(!off.is_echo(&key("a"), Direction::Upload, &json!(1)));

        let guard = EchoGuard::new(Duration::from_secs(1));
        guard.record(&key("a"), Direction::Upload, &json!(1));
        guard.forget(&key("a"), Direction::Upload);
        assert!(!guard.is_echo(&key("a"), Direction::Upload, &json!(1)));
    }
}
