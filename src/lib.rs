// Archive Fetch Library
// 分片断点续传下载引擎

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 下载引擎模块
pub mod downloader;

// 🔥 公共模块（慢速连接检测）
pub mod common;

// 导出常用类型
pub use config::{AppConfig, DownloadConfig, LogConfig};
pub use downloader::{
    ChunkDescriptor, DownloadManager, DownloadResult, ProgressCallback, ProgressUpdate,
    ProtocolHandler, UrlResolver,
};
pub use error::{DownloadError, Result};
