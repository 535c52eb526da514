//! 远程会话：绑定根地址的存储连接及其认证状态

use crate::core::RemoteKey;
use crate::error::SyncError;
use crate::storage::{display_path, CancelHandle, ChildChange, RemoteConnector, RemoteStore, ValueTree};
use reqwest::Url;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct RemoteSession {
    id: Uuid,
    reference: Url,
    store: Arc<dyn RemoteStore>,
    authenticated: AtomicBool,
}

impl RemoteSession {
    /// 解析根地址并建立存储连接，不做认证
    pub fn connect(connector: &dyn RemoteConnector, reference: &str) -> Result<Self, SyncError> {
        let url = Url::parse(reference.trim()).map_err(|e| SyncError::InvalidReference {
            reference: reference.to_string(),
            cause: e.to_string(),
        })?;
        let store = connector
            .connect(&url)
            .map_err(|e| SyncError::InvalidReference {
                reference: reference.to_string(),
                cause: format!("{:#}", e),
            })?;

        let id = Uuid::new_v4();
        tracing::info!("创建远程会话 {}: {}", id, store.name());
        Ok(Self {
            id,
            reference: url,
            store,
            authenticated: AtomicBool::new(false),
        })
    }

    pub async fn authenticate(&self, token: &str) -> Result<(), SyncError> {
        self.store
            .authenticate(token)
            .await
            .map_err(|e| SyncError::Authentication(format!("{:#}", e)))?;
        self.authenticated.store(true, Ordering::SeqCst);
        tracing::info!("会话 {} 认证成功", self.id);
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn ensure_authenticated(&self) -> Result<(), SyncError> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(SyncError::NotAuthenticated)
        }
    }

    /// 合并写入，未出现的兄弟节点保持不变
    pub async fn write_subtree(&self, path: &[RemoteKey], value: &ValueTree) -> Result<(), SyncError> {
        self.ensure_authenticated()?;
        self.store
            .write_subtree(path, value)
            .await
            .map_err(|e| SyncError::transfer(display_path(path), e))
    }

    pub async fn read_subtree_once(&self, path: &[RemoteKey]) -> Result<ValueTree, SyncError> {
        self.ensure_authenticated()?;
        self.store
            .read_subtree_once(path)
            .await
            .map_err(|e| SyncError::transfer(display_path(path), e))
    }

    /// 订阅路径下直接子节点的变化，按顺序送入 `tx`
    pub async fn subscribe_child_changes(
        &self,
        path: &[RemoteKey],
        tx: mpsc::Sender<ChildChange>,
    ) -> Result<CancelHandle, SyncError> {
        self.ensure_authenticated()?;
        self.store
            .subscribe_children(path, tx)
            .await
            .map_err(|e| SyncError::SubscriptionSetup(format!("{:#}", e)))
    }

    pub fn reference(&self) -> &Url {
        &self.reference
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn key(s: &str) -> RemoteKey {
        RemoteKey::new(s).unwrap()
    }

    #[test]
    fn test_malformed_reference() {
        let store = MemoryStore::new();
        let err = RemoteSession::connect(&store, "not a url").err().unwrap();
        assert!(matches!(err, SyncError::InvalidReference { .. }));
    }

    #[tokio::test]
    async fn test_operations_require_authentication() {
        let store = MemoryStore::new().with_token("secret");
        let session = RemoteSession::connect(&store, "memory://test").unwrap();

        let err = session.write_subtree(&[key("a")], &json!(1)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotAuthenticated));
        assert!(store.writes().is_empty());

        let err = session.authenticate("wrong").await.unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));
        assert!(!session.is_authenticated());

        session.authenticate("secret").await.unwrap();
        session.write_subtree(&[key("a")], &json!({"x": 1})).await.unwrap();
        assert_eq!(
            session.read_subtree_once(&[key("a")]).await.unwrap(),
            json!({"x": 1})
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_transfer_error() {
        let store = MemoryStore::new();
        store.fail_writes_for("a");
        let session = RemoteSession::connect(&store, "memory://test").unwrap();
        session.authenticate("any").await.unwrap();

        let err = session.write_subtree(&[key("a")], &json!(1)).await.unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_subscription_failure() {
        let store = MemoryStore::new();
        store.fail_subscribe(true);
        let session = RemoteSession::connect(&store, "memory://test").unwrap();
        session.authenticate("any").await.unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let err = session.subscribe_child_changes(&[], tx).await.unwrap_err();
        assert!(matches!(err, SyncError::SubscriptionSetup(_)));
    }
}
