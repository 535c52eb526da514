//! Firebase 实时数据库 REST 接口
//!
//! 读写走 `<ref>/<path>.json`，令牌作为 `auth` 参数；
//! 订阅使用 `text/event-stream`，按 put / patch 事件维护本地快照并上报子节点变化。

use super::tree::{get_at, merge_at, set_at};
use super::{CancelHandle, ChildChange, RemoteStore, ValueTree, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS};
use crate::core::RemoteKey;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{header, Method, Response, StatusCode, Url};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::io;
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

const MAX_RECONNECTS: u32 = 5;
const RETRY_BASE_DELAY_MS: u64 = 2000;

pub struct RestStore {
    client: reqwest::Client,
    /// 事件流连接不设整体超时
    stream_client: reqwest::Client,
    reference: Url,
    token: RwLock<Option<String>>,
    name: String,
    max_reconnects: u32,
    retry_base_delay_ms: u64,
}

impl RestStore {
    pub fn new(reference: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            .build()?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
            .build()?;
        let name = format!("firebase:{}", reference);

        Ok(Self {
            client,
            stream_client,
            reference,
            token: RwLock::new(None),
            name,
            max_reconnects: MAX_RECONNECTS,
            retry_base_delay_ms: RETRY_BASE_DELAY_MS,
        })
    }

    /// 订阅断开后的重连次数与退避基准
    pub fn with_reconnect(mut self, max_reconnects: u32, retry_base_delay_ms: u64) -> Self {
        self.max_reconnects = max_reconnects;
        self.retry_base_delay_ms = retry_base_delay_ms;
        self
    }

    fn current_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    /// 构造 `<ref>/<path>.json?...` 地址
    fn endpoint(&self, path: &[RemoteKey], query: &[(&str, &str)], token: Option<&str>) -> Url {
        let mut segments: Vec<String> = self
            .reference
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).map(|s| s.to_string()).collect())
            .unwrap_or_default();
        segments.extend(
            path.iter()
                .map(|k| urlencoding::encode(k.as_str()).into_owned()),
        );

        let mut url = self.reference.clone();
        url.set_fragment(None);
        url.set_path(&format!("/{}.json", segments.join("/")));

        let mut params: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect();
        if let Some(token) = token {
            params.push(format!("auth={}", urlencoding::encode(token)));
        }
        let query = params.join("&");
        url.set_query(if params.is_empty() {
            None
        } else {
            Some(query.as_str())
        });
        url
    }

    async fn check(resp: Response, what: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{}失败 ({}): {}", what, status, body.trim())
    }
}

#[async_trait]
impl RemoteStore for RestStore {
    async fn authenticate(&self, token: &str) -> Result<()> {
        let url = self.endpoint(&[], &[("shallow", "true")], Some(token));
        let resp = self.client.get(url).send().await.context("认证请求失败")?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("权限被拒绝: {}", body.trim())
            }
            _ => {
                Self::check(resp, "认证").await?;
            }
        }

        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token.to_string());
        }
        Ok(())
    }

    async fn write_subtree(&self, path: &[RemoteKey], value: &ValueTree) -> Result<()> {
        let url = self.endpoint(path, &[], self.current_token().as_deref());
        // 对象使用 PATCH 合并，标量只能整体替换
        let method = if value.is_object() {
            Method::PATCH
        } else {
            Method::PUT
        };

        let resp = self
            .client
            .request(method, url)
            .json(value)
            .send()
            .await
            .context("写入请求失败")?;
        Self::check(resp, "写入").await?;
        Ok(())
    }

    async fn read_subtree_once(&self, path: &[RemoteKey]) -> Result<ValueTree> {
        let url = self.endpoint(path, &[], self.current_token().as_deref());
        let resp = self
            .client
            .get(url)
            .timeout(Duration::from_secs(IO_TIMEOUT_SECS))
            .send()
            .await
            .context("读取请求失败")?;
        let resp = Self::check(resp, "读取").await?;
        Ok(resp.json::<ValueTree>().await?)
    }

    async fn subscribe_children(
        &self,
        path: &[RemoteKey],
        tx: mpsc::Sender<ChildChange>,
    ) -> Result<CancelHandle> {
        let url = self.endpoint(path, &[], self.current_token().as_deref());
        // 首次连接失败直接返回，由调用方处理
        let resp = open_stream(&self.stream_client, url.clone()).await?;

        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        let client = self.stream_client.clone();
        let name = self.name.clone();
        let max_reconnects = self.max_reconnects;
        let base_delay_ms = self.retry_base_delay_ms;

        tokio::spawn(async move {
            // 快照跨重连保留，重连后的根节点 put 只上报差异
            let mut tracker = ChildTracker::default();
            let mut current = Some(resp);
            let mut attempt = 0u32;

            loop {
                if let Some(resp) = current.take() {
                    match pump_events(resp, &mut tracker, &tx, &stopped).await {
                        StreamEnd::Stopped => break,
                        StreamEnd::Disconnected(reason) => {
                            tracing::warn!("订阅连接中断 {}: {}", name, reason);
                        }
                    }
                }

                if attempt >= max_reconnects {
                    tracing::error!("订阅最终失败 (已重试{}次): {}", max_reconnects, name);
                    break;
                }
                // 指数退避
                let delay = base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
                attempt += 1;
                tracing::warn!(
                    "订阅中断，{}ms 后重连 ({}/{}): {}",
                    delay,
                    attempt,
                    max_reconnects,
                    name
                );
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }

                match open_stream(&client, url.clone()).await {
                    Ok(resp) => {
                        tracing::info!("订阅已重新连接: {}", name);
                        attempt = 0;
                        current = Some(resp);
                    }
                    Err(e) => tracing::warn!("重连失败 {}: {:#}", name, e),
                }
            }
            tracing::debug!("订阅任务退出: {}", name);
        });

        let label = format!("{} subscription", self.name);
        Ok(CancelHandle::new(label, move || cancel.cancel()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

async fn open_stream(client: &reqwest::Client, url: Url) -> Result<Response> {
    let resp = client
        .get(url)
        .header(header::ACCEPT, "text/event-stream")
        .send()
        .await
        .context("订阅请求失败")?;
    RestStore::check(resp, "订阅").await
}

/// 单次连接的结束原因
enum StreamEnd {
    /// 取消订阅或接收端已关闭，不再重连
    Stopped,
    Disconnected(String),
}

/// 读取一个事件流连接直到结束
async fn pump_events(
    resp: Response,
    tracker: &mut ChildTracker,
    tx: &mpsc::Sender<ChildChange>,
    stopped: &CancellationToken,
) -> StreamEnd {
    let body = Box::pin(resp.bytes_stream().map_err(io::Error::other));
    let reader: StreamReader<_, bytes::Bytes> = StreamReader::new(body);
    let mut lines = LinesStream::new(BufReader::new(reader).lines());
    let mut parser = EventStreamParser::default();

    loop {
        let line = tokio::select! {
            _ = stopped.cancelled() => return StreamEnd::Stopped,
            line = lines.next() => line,
        };

        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => return StreamEnd::Disconnected(format!("读取失败: {}", e)),
            None => return StreamEnd::Disconnected("事件流已结束".to_string()),
        };

        let Some(event) = parser.push_line(&line) else {
            continue;
        };
        match tracker.apply(&event) {
            Ok(StreamOutcome::Changes(changes)) => {
                for change in changes {
                    if tx.send(change).await.is_err() {
                        return StreamEnd::Stopped;
                    }
                }
            }
            Ok(StreamOutcome::Ignore) => {}
            Ok(StreamOutcome::Closed(reason)) => {
                return StreamEnd::Disconnected(format!("服务端关闭订阅: {}", reason))
            }
            Err(e) => tracing::warn!("无法解析事件 {}: {}", event.event, e),
        }
    }
}

// ============ 事件流解析 ============

/// 一个完整的 server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEvent {
    event: String,
    data: String,
}

/// 按行累积，空行时产出事件
#[derive(Debug, Default)]
struct EventStreamParser {
    event: Option<String>,
    data: Vec<String>,
}

impl EventStreamParser {
    fn push_line(&mut self, line: &str) -> Option<StreamEvent> {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                return None;
            }
            let event = StreamEvent {
                event: self.event.take().unwrap_or_else(|| "message".to_string()),
                data: self.data.join("\n"),
            };
            self.data.clear();
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

#[derive(Debug, Deserialize)]
struct PathData {
    path: String,
    data: ValueTree,
}

#[derive(Debug, PartialEq)]
enum StreamOutcome {
    Changes(Vec<ChildChange>),
    Ignore,
    Closed(String),
}

/// 维护订阅节点的快照，把 put / patch 转换为直接子节点的变化
#[derive(Debug, Default)]
struct ChildTracker {
    snapshot: Option<ValueTree>,
}

impl ChildTracker {
    fn apply(&mut self, event: &StreamEvent) -> Result<StreamOutcome> {
        let is_put = match event.event.as_str() {
            "put" => true,
            "patch" => false,
            "cancel" | "auth_revoked" => {
                return Ok(StreamOutcome::Closed(format!("{} {}", event.event, event.data)))
            }
            _ => return Ok(StreamOutcome::Ignore),
        };

        let payload: PathData = serde_json::from_str(&event.data)?;
        let segments: Vec<&str> = payload.path.split('/').filter(|s| !s.is_empty()).collect();

        // 首个根节点 put 是初始快照，不算变化
        if self.snapshot.is_none() && is_put && segments.is_empty() {
            self.snapshot = Some(payload.data);
            return Ok(StreamOutcome::Ignore);
        }

        let snapshot = self.snapshot.get_or_insert(ValueTree::Null);
        let before = snapshot.clone();
        if is_put {
            set_at(snapshot, &segments, payload.data.clone());
        } else {
            merge_at(snapshot, &segments, &payload.data);
        }

        let touched: BTreeSet<String> = match segments.first() {
            Some(first) => std::iter::once(first.to_string()).collect(),
            None => {
                let keys = |v: &ValueTree| -> Vec<String> {
                    v.as_object()
                        .map(|m| m.keys().cloned().collect())
                        .unwrap_or_default()
                };
                let mut all: BTreeSet<String> = keys(&payload.data).into_iter().collect();
                if is_put {
                    all.extend(keys(&before));
                }
                all
            }
        };

        let mut changes = Vec::new();
        for child in touched {
            let Some(current) = get_at(snapshot, &[child.as_str()]) else {
                continue;
            };
            if segments.is_empty() && get_at(&before, &[child.as_str()]) == Some(current) && is_put {
                continue;
            }
            changes.push(ChildChange {
                key: RemoteKey::new(child.as_str())?,
                value: current.clone(),
            });
        }
        Ok(StreamOutcome::Changes(changes))
    }
}
