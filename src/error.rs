//! 下载引擎错误类型
//!
//! 调用方需要区分几类失败：
//! - HTML 页面（直链过期，应在浏览器中打开该页面而不是重试）
//! - 可重试的网络错误（超时、连接被重置）
//! - 其他致命错误

use std::path::PathBuf;
use thiserror::Error;

/// 下载引擎结果类型
pub type Result<T> = std::result::Result<T, DownloadError>;

/// 下载错误
#[derive(Debug, Error)]
pub enum DownloadError {
    /// 没有提供任何下载链接
    #[error("没有可用的下载链接")]
    NoUrls,

    /// 链接无法解析
    #[error("无法解析下载链接: {0}")]
    InvalidUrl(String),

    /// 服务器返回了非成功状态码（包括超过重定向上限）
    #[error("HTTP错误 {status} ({message}): {url}")]
    Http {
        status: u16,
        message: String,
        url: String,
    },

    /// 服务器返回了 HTML 页面而不是文件
    #[error("下载内容是 HTML 页面: {url}")]
    DownloadIsHtml { url: String },

    /// 不支持的协议
    #[error("不支持的协议: {0}")]
    UnsupportedProtocol(String),

    /// 流程被中止（例如文件已关闭、没有可续传的分片）
    #[error("操作已中止: {0}")]
    ProcessCanceled(String),

    /// 输出文件被占用
    #[error("输出文件被占用: {path:?}")]
    FileLocked { path: PathBuf },

    /// 文件系统错误
    #[error("文件操作失败 {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 网络错误
    #[error("网络错误: {source}")]
    Network {
        /// 是否属于超时 / 连接重置类错误
        retryable: bool,
        #[source]
        source: reqwest::Error,
    },

    /// 读取响应超时
    #[error("读取超时: {url}")]
    Timeout { url: String },
}

impl DownloadError {
    /// 包装文件系统错误
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DownloadError::Io {
            path: path.into(),
            source,
        }
    }

    /// 从 reqwest 错误构造，并判定是否可重试
    pub fn from_reqwest(source: reqwest::Error) -> Self {
        let retryable = is_timeout_or_reset(&source);
        DownloadError::Network { retryable, source }
    }

    /// 超时或连接重置：已有进度时由 worker 原地重试
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Network { retryable, .. } => *retryable,
            DownloadError::Io { source, .. } => is_reset_kind(source.kind()),
            DownloadError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// 服务器返回的 HTTP 状态码（如果有）
    pub fn status(&self) -> Option<u16> {
        match self {
            DownloadError::Http { status, .. } => Some(*status),
            DownloadError::Network { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

fn is_reset_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
    )
}

/// 判断 reqwest 错误是否为超时 / 连接重置
///
/// 响应体读取中途断开（is_body）也按连接重置处理
fn is_timeout_or_reset(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_body() {
        return true;
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<std::io::Error>() {
            if is_reset_kind(io_err.kind()) {
                return true;
            }
        }
        source = inner.source();
    }

    false
}
