//! 下载链接解析
//!
//! 非直链（例如镜像、会员链接）通过按协议注册的处理器换成真实地址，
//! 结果缓存 5 分钟，避免每个分片、每次重试都重新解析

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// 解析结果缓存时间
pub const URL_RESOLVE_EXPIRE: Duration = Duration::from_secs(5 * 60);

/// 协议处理器
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// 把输入链接解析为可直接下载的地址列表
    async fn resolve(&self, url: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    time: Instant,
    urls: Vec<String>,
}

/// 链接解析器
#[derive(Default)]
pub struct UrlResolver {
    handlers: RwLock<HashMap<String, Arc<dyn ProtocolHandler>>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl std::fmt::Debug for UrlResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlResolver")
            .field("schemes", &self.handlers.read().keys().collect::<Vec<_>>())
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl UrlResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册协议处理器（scheme 不含冒号，例如 `nxm`）
    pub fn register(&self, scheme: &str, handler: Arc<dyn ProtocolHandler>) {
        self.handlers
            .write()
            .insert(scheme.to_ascii_lowercase(), handler);
    }

    /// 解析单个链接
    ///
    /// - 无法解析的链接返回空列表
    /// - 未注册处理器的协议原样返回
    /// - 处理器失败时记录警告并缓存空列表
    pub async fn resolve(&self, input: &str) -> Vec<String> {
        self.resolve_at(input, Instant::now()).await
    }

    async fn resolve_at(&self, input: &str, now: Instant) -> Vec<String> {
        if let Some(entry) = self.cache.lock().get(input) {
            if now.saturating_duration_since(entry.time) < URL_RESOLVE_EXPIRE {
                return entry.urls.clone();
            }
        }

        let scheme = match Url::parse(input) {
            Ok(url) => url.scheme().to_string(),
            Err(e) => {
                debug!("无法解析链接 {}: {}", input, e);
                return Vec::new();
            }
        };

        let handler = self.handlers.read().get(&scheme).cloned();
        let Some(handler) = handler else {
            return vec![input.to_string()];
        };

        let urls = match handler.resolve(input).await {
            Ok(urls) => urls,
            Err(e) => {
                warn!("链接解析失败 {}: {}", input, e);
                Vec::new()
            }
        };

        let mut cache = self.cache.lock();
        // 顺带清理过期条目
        cache.retain(|_, entry| now.saturating_duration_since(entry.time) < URL_RESOLVE_EXPIRE);
        cache.insert(
            input.to_string(),
            CacheEntry {
                time: now,
                urls: urls.clone(),
            },
        );

        urls
    }

    /// 按顺序解析所有链接并展开
    pub async fn resolve_all(&self, inputs: &[String]) -> Vec<String> {
        let mut result = Vec::new();
        for input in inputs {
            result.extend(self.resolve(input).await);
        }
        result
    }
}
