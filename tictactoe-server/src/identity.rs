//! 身份校验
//!
//! 对局模式下玩家带着平台签发的凭证加入，由 `IdentityValidator` 换成玩家身份。
//! 校验期间不持有任何房间锁。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use protocol::{ConnectionId, Identity};

/// 校验失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// 凭证无效
    #[error("invalid credential")]
    Invalid,

    /// 校验服务不可用
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// 身份校验接口
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn validate(&self, credential: &str) -> Result<Identity, ValidationError>;
}

#[async_trait]
impl<V: IdentityValidator + ?Sized> IdentityValidator for std::sync::Arc<V> {
    async fn validate(&self, credential: &str) -> Result<Identity, ValidationError> {
        (**self).validate(credential).await
    }
}

/// 带 TTL 缓存的校验器
///
/// 只缓存成功结果；未命中时总是回落到内层校验器。
pub struct CachedValidator<V> {
    inner: V,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Identity, Instant)>>,
}

impl<V> CachedValidator<V> {
    pub fn new(inner: V, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Identity, Instant)>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, credential: &str) -> Option<Identity> {
        let now = Instant::now();
        let mut cache = self.lock();
        match cache.get(credential) {
            Some((identity, expires)) if *expires > now => Some(identity.clone()),
            Some(_) => {
                cache.remove(credential);
                None
            }
            None => None,
        }
    }

    fn store(&self, credential: &str, identity: Identity) {
        let now = Instant::now();
        let Some(expires) = now.checked_add(self.ttl) else {
            return;
        };
        let mut cache = self.lock();
        cache.retain(|_, (_, expires)| *expires > now);
        cache.insert(credential.to_string(), (identity, expires));
    }

    /// 清除某个凭证的缓存
    pub fn invalidate(&self, credential: &str) {
        self.lock().remove(credential);
    }

    pub fn cached_count(&self) -> usize {
        self.lock().len()
    }
}

#[async_trait]
impl<V: IdentityValidator> IdentityValidator for CachedValidator<V> {
    async fn validate(&self, credential: &str) -> Result<Identity, ValidationError> {
        if let Some(identity) = self.lookup(credential) {
            debug!(player_id = %identity.id, "身份缓存命中");
            return Ok(identity);
        }

        let identity = self.inner.validate(credential).await?;
        self.store(credential, identity.clone());
        Ok(identity)
    }
}

/// 信任凭证内容的校验器（开发环境用）
///
/// 凭证格式为 `<玩家 ID>:<昵称>`。
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedValidator;

#[async_trait]
impl IdentityValidator for TrustedValidator {
    async fn validate(&self, credential: &str) -> Result<Identity, ValidationError> {
        let (id, name) = credential
            .split_once(':')
            .ok_or(ValidationError::Invalid)?;
        let (id, name) = (id.trim(), name.trim());
        if id.is_empty() || name.is_empty() {
            return Err(ValidationError::Invalid);
        }
        Ok(Identity::new(id, name))
    }
}

/// 休闲模式的游客身份
pub fn guest_identity(connection: ConnectionId) -> Identity {
    Identity::new(format!("guest-{}", connection), format!("Guest {}", connection))
}
