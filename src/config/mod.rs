// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::common::SlowWorkerConfig;
use crate::downloader::SpeedCalculatorConfig;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认下载目录（enqueue 未指定目标目录时使用）
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 全局最大 worker 数（所有下载共享）
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// 单个文件最多拆分的分片数
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    /// 请求使用的 User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 传输层读超时（秒），超时按可重试错误处理
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// 全局速度上报间隔（毫秒）
    #[serde(default = "default_speed_report_interval_ms")]
    pub speed_report_interval_ms: u64,
    /// 慢速 worker 检测配置
    #[serde(default)]
    pub starvation: StarvationConfig,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_workers() -> usize {
    8
}

fn default_max_chunks() -> usize {
    4
}

fn default_user_agent() -> String {
    format!("archive-fetch/{}", env!("CARGO_PKG_VERSION"))
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_speed_report_interval_ms() -> u64 {
    1000
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_workers: default_max_workers(),
            max_chunks: default_max_chunks(),
            user_agent: default_user_agent(),
            read_timeout_secs: default_read_timeout_secs(),
            speed_report_interval_ms: default_speed_report_interval_ms(),
            starvation: StarvationConfig::default(),
        }
    }
}

impl DownloadConfig {
    /// 校验并发参数
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            anyhow::bail!("max_workers 必须大于 0");
        }
        if self.max_chunks == 0 {
            anyhow::bail!("max_chunks 必须大于 0");
        }
        if self.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent 不能为空");
        }
        self.starvation.validate()
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn speed_report_interval(&self) -> Duration {
        Duration::from_millis(self.speed_report_interval_ms.max(10))
    }
}

/// 慢速 worker 检测配置
///
/// 阈值没有理论推导，只是经验值，因此全部可配置：
/// - 速度窗口内连续判定为"饥饿"超过 restart_after_samples 次时重启该 worker 的连接
/// - 只在下载开始后 restart_window_minutes 分钟内重启（下载链接可能过期）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StarvationConfig {
    /// 速度统计窗口（秒）
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// 近期速度低于历史速度的比例阈值
    #[serde(default = "default_starving_ratio")]
    pub starving_ratio: f64,
    /// 连续饥饿采样次数阈值
    #[serde(default = "default_restart_after_samples")]
    pub restart_after_samples: u32,
    /// 允许重启的时间窗口（分钟）
    #[serde(default = "default_restart_window_minutes")]
    pub restart_window_minutes: u64,
}

fn default_window_secs() -> u64 {
    5
}
fn default_starving_ratio() -> f64 {
    0.25
}
fn default_restart_after_samples() -> u32 {
    15
}
fn default_restart_window_minutes() -> u64 {
    15
}

impl Default for StarvationConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            starving_ratio: default_starving_ratio(),
            restart_after_samples: default_restart_after_samples(),
            restart_window_minutes: default_restart_window_minutes(),
        }
    }
}

impl StarvationConfig {
    fn validate(&self) -> Result<()> {
        if self.window_secs == 0 {
            anyhow::bail!("starvation.window_secs 必须大于 0");
        }
        if !(0.0..1.0).contains(&self.starving_ratio) {
            anyhow::bail!("starvation.starving_ratio 必须在 [0, 1) 之间");
        }
        Ok(())
    }

    /// 转换为速度计算器配置
    pub fn to_speed_config(&self) -> SpeedCalculatorConfig {
        SpeedCalculatorConfig {
            window_secs: self.window_secs,
            starving_ratio: self.starving_ratio,
        }
    }

    /// 转换为慢速 worker 检测配置
    pub fn to_slow_worker_config(&self) -> SlowWorkerConfig {
        SlowWorkerConfig {
            restart_after_samples: self.restart_after_samples,
            restart_window: Duration::from_secs(self.restart_window_minutes * 60),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .download
            .validate()
            .context("配置文件中的下载参数验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.download
            .validate()
            .context("保存配置失败：下载参数无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.download.max_workers, 8);
        assert_eq!(config.download.max_chunks, 4);
        assert!(config.download.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.download.max_workers = 3;
        config.download.starvation.restart_after_samples = 7;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.download.max_workers, 3);
        assert_eq!(loaded.download.starvation.restart_after_samples, 7);
        assert_eq!(loaded.log.level, "info");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [download]
            max_chunks = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.download.max_chunks, 2);
        assert_eq!(config.download.max_workers, 8);
        assert_eq!(config.download.starvation.window_secs, 5);
        assert!(config.log.enabled);
    }

    #[test]
    fn test_config_validation() {
        let mut config = DownloadConfig::default();
        assert!(config.validate().is_ok());

        config.max_workers = 0;
        assert!(config.validate().is_err());

        config.max_workers = 4;
        config.starvation.starving_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_starvation_config_conversion() {
        let config = StarvationConfig {
            window_secs: 8,
            starving_ratio: 0.3,
            restart_after_samples: 20,
            restart_window_minutes: 10,
        };

        let speed = config.to_speed_config();
        assert_eq!(speed.window_secs, 8);
        assert_eq!(speed.starving_ratio, 0.3);

        let slow = config.to_slow_worker_config();
        assert_eq!(slow.restart_after_samples, 20);
        assert_eq!(slow.restart_window, Duration::from_secs(600));
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }
}
