//! 日志系统
//!
//! 控制台 + 文件双输出。文件按启动时间命名，超过大小上限后滚动，
//! 启动时清理超过保留天数的旧日志

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// 日志文件名前缀
const LOG_PREFIX: &str = "archive-fetch.";
const LOG_SUFFIX: &str = ".log";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct RollingState {
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    started: String,
    log_dir: PathBuf,
    file: Option<File>,
    /// 0 为首个文件，之后为 _1、_2 ...
    index: u32,
    max_file_size: u64,
    written: u64,
}

impl RollingState {
    fn path_for(&self, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}{}", LOG_PREFIX, self.started, LOG_SUFFIX)
        } else {
            format!("{}{}_{}{}", LOG_PREFIX, self.started, index, LOG_SUFFIX)
        };
        self.log_dir.join(name)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(self.index))?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            if let Some(mut file) = self.file.take() {
                file.flush()?;
            }
            self.index += 1;
            self.open_current()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 按大小滚动的日志文件
#[derive(Clone)]
pub struct RollingLogFile {
    state: Arc<Mutex<RollingState>>,
}

impl RollingLogFile {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let mut state = RollingState {
            started: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir,
            file: None,
            index: 0,
            max_file_size,
            written: 0,
        };
        state.open_current()?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// 当前写入的文件
    pub fn current_path(&self) -> PathBuf {
        let state = self.state.lock();
        state.path_for(state.index)
    }
}

impl Write for RollingLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 日志守卫，必须保持存活，否则文件写入线程会退出
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

fn console_layer() -> Box<dyn Layer<Registry> + Send + Sync> {
    fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true)
        .boxed()
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的级别。重复初始化时保留已有的订阅器
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut layers = vec![console_layer()];
    let mut file_guard = None;

    if config.enabled {
        match open_log_file(config) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                layers.push(
                    fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                        .with_ansi(false)
                        .with_writer(writer)
                        .boxed(),
                );
                file_guard = Some(guard);
            }
            Err(e) => {
                eprintln!(
                    "创建日志文件失败: {:?}, 错误: {}, 回退到仅控制台输出",
                    config.log_dir, e
                );
            }
        }
    }

    if tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .is_err()
    {
        debug!("日志系统已初始化，跳过");
        return LogGuard { _file_guard: None };
    }

    if file_guard.is_some() {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
            config.log_dir,
            config.retention_days,
            config.level,
            config.max_file_size as f64 / 1024.0 / 1024.0
        );
        cleanup_old_logs(&config.log_dir, config.retention_days, Local::now().date_naive());
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

fn open_log_file(config: &LogConfig) -> io::Result<RollingLogFile> {
    fs::create_dir_all(&config.log_dir)?;
    RollingLogFile::new(config.log_dir.clone(), config.max_file_size)
}

/// 删除超过保留天数的日志，返回删除数量
fn cleanup_old_logs(log_dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(date) = log_file_date(name) else {
            continue;
        };

        if today.signed_duration_since(date) > retention {
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }
    deleted
}

/// 日志文件名中的日期
///
/// `archive-fetch.2024-05-01-120000.log`、`archive-fetch.2024-05-01-120000_3.log`
fn log_file_date(name: &str) -> Option<NaiveDate> {
    let stamp = name.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_SUFFIX)?;
    let date = stamp.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_file_date() {
        assert_eq!(
            log_file_date("archive-fetch.2024-05-01-120000.log"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(
            log_file_date("archive-fetch.2024-05-01-120000_3.log"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(log_file_date("other.2024-05-01.log"), None);
        assert_eq!(log_file_date("archive-fetch.bad.log"), None);
    }

    #[test]
    fn test_cleanup_old_logs() {
        let dir = tempdir().unwrap();
        for name in [
            "archive-fetch.2024-01-01-000000.log",
            "archive-fetch.2024-01-09-000000_1.log",
            "archive-fetch.2024-01-10-000000.log",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let today = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        assert_eq!(cleanup_old_logs(dir.path(), 7, today), 1);
        assert!(!dir.path().join("archive-fetch.2024-01-01-000000.log").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_rolling_log_file() {
        let dir = tempdir().unwrap();
        let mut file = RollingLogFile::new(dir.path().to_path_buf(), 10).unwrap();
        let first = file.current_path();

        file.write_all(b"0123456789").unwrap();
        file.write_all(b"abc").unwrap();
        file.flush().unwrap();

        let second = file.current_path();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_1.log"));
        assert_eq!(fs::read(&first).unwrap(), b"0123456789");
        assert_eq!(fs::read(&second).unwrap(), b"abc");
    }
}
