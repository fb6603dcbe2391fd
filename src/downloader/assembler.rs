//! 文件组装器
//!
//! 一个下载对应一个输出文件，多个分片的 worker 并发按偏移写入：
//! - 写入为定位写（seek + write），不依赖追加顺序
//! - 记录已写入区间，维护从 0 开始的连续前缀（synced）
//! - 支持在写入过程中把文件改名为服务器给出的真实文件名

use parking_lot::Mutex as SyncMutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{DownloadError, Result};

#[derive(Debug)]
struct AssemblerState {
    file: Option<File>,
    /// 已写入区间 start -> end（互不重叠、已合并）
    written: BTreeMap<u64, u64>,
    total_size: Option<u64>,
}

/// 文件组装器
#[derive(Debug)]
pub struct FileAssembler {
    state: Mutex<AssemblerState>,
    path: SyncMutex<PathBuf>,
    closed: AtomicBool,
    synced: AtomicU64,
}

impl FileAssembler {
    /// 打开已存在的文件（预留的空文件或未完成的部分文件），不截断
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_for_write(&path).await?;

        debug!("打开输出文件: {:?}", path);

        Ok(Self {
            state: Mutex::new(AssemblerState {
                file: Some(file),
                written: BTreeMap::new(),
                total_size: None,
            }),
            path: SyncMutex::new(path),
            closed: AtomicBool::new(false),
            synced: AtomicU64::new(0),
        })
    }

    /// 在 `offset` 处写入数据
    ///
    /// 返回从 0 开始的连续已写入前缀是否因本次写入而前移
    pub async fn add_chunk(&self, offset: u64, data: &[u8]) -> Result<bool> {
        if self.is_closed() {
            return Err(already_closed());
        }

        let mut state = self.state.lock().await;
        let path = self.path();
        let file = state.file.as_mut().ok_or_else(already_closed)?;

        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| DownloadError::io(&path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| DownloadError::io(&path, e))?;

        if data.is_empty() {
            return Ok(false);
        }

        insert_range(&mut state.written, offset, offset + data.len() as u64);
        Ok(self.update_synced(&state.written))
    }

    /// 标记一段已存在于磁盘上的数据（续传时之前会话写入的部分）
    pub async fn mark_written(&self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut state = self.state.lock().await;
        insert_range(&mut state.written, start, end);
        self.update_synced(&state.written);
    }

    fn update_synced(&self, written: &BTreeMap<u64, u64>) -> bool {
        let prefix = match written.iter().next() {
            Some((0, end)) => *end,
            _ => 0,
        };
        let previous = self.synced.fetch_max(prefix, Ordering::SeqCst);
        prefix > previous
    }

    /// 设置文件总大小（预分配）
    pub async fn set_total_size(&self, size: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let path = self.path();
        state.total_size = Some(size);

        if let Some(file) = state.file.as_mut() {
            file.set_len(size)
                .await
                .map_err(|e| DownloadError::io(&path, e))?;
            debug!("预分配文件大小: {:?} -> {} bytes", path, size);
        }

        Ok(())
    }

    /// 将输出文件改名
    ///
    /// 持有写锁完成：刷新并释放句柄 → 重命名（覆盖预留的同名空文件）→ 重新打开。
    /// 正在等待锁的写入会在新文件上继续
    pub async fn rename(&self, new_path: impl AsRef<Path>) -> Result<()> {
        let new_path = new_path.as_ref().to_path_buf();
        let mut state = self.state.lock().await;
        let old_path = self.path();

        if old_path == new_path {
            return Ok(());
        }

        let reopen = match state.file.take() {
            Some(mut file) => {
                file.flush()
                    .await
                    .map_err(|e| DownloadError::io(&old_path, e))?;
                drop(file);
                true
            }
            None => false,
        };

        fs::rename(&old_path, &new_path)
            .await
            .map_err(|e| DownloadError::io(&new_path, e))?;

        *self.path.lock() = new_path.clone();

        if reopen && !self.is_closed() {
            state.file = Some(open_for_write(&new_path).await?);
        }

        info!("输出文件已改名: {:?} -> {:?}", old_path, new_path);
        Ok(())
    }

    /// 刷新并释放文件句柄（幂等）
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let path = self.path();
        if let Some(mut file) = state.file.take() {
            file.flush().await.map_err(|e| DownloadError::io(&path, e))?;
            file.sync_all()
                .await
                .map_err(|e| DownloadError::io(&path, e))?;
        }

        debug!("输出文件已关闭: {:?}", path);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 从 0 开始连续写入的字节数
    pub fn synced_prefix(&self) -> u64 {
        self.synced.load(Ordering::SeqCst)
    }

    /// 当前文件路径
    pub fn path(&self) -> PathBuf {
        self.path.lock().clone()
    }

    pub async fn total_size(&self) -> Option<u64> {
        self.state.lock().await.total_size
    }
}

async fn open_for_write(path: &Path) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| {
            if is_sharing_violation(&e) {
                DownloadError::FileLocked {
                    path: path.to_path_buf(),
                }
            } else {
                DownloadError::io(path, e)
            }
        })
}

/// 文件被其他进程占用
fn is_sharing_violation(err: &std::io::Error) -> bool {
    match err.raw_os_error() {
        // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
        Some(32) | Some(33) if cfg!(windows) => true,
        // EBUSY / ETXTBSY
        Some(16) | Some(26) if cfg!(unix) => true,
        _ => false,
    }
}

fn already_closed() -> DownloadError {
    DownloadError::ProcessCanceled("file already closed".to_string())
}

/// 插入 [start, end) 并与相邻 / 重叠区间合并
fn insert_range(ranges: &mut BTreeMap<u64, u64>, start: u64, end: u64) {
    let mut new_start = start;
    let mut new_end = end;

    // 左侧可能与之相接的区间
    if let Some((&s, &e)) = ranges.range(..=start).next_back() {
        if e >= start {
            new_start = s;
            new_end = new_end.max(e);
            ranges.remove(&s);
        }
    }

    // 右侧被覆盖或相接的区间
    let overlapping: Vec<u64> = ranges
        .range(new_start..=new_end)
        .map(|(&s, _)| s)
        .collect();
    for s in overlapping {
        if let Some(e) = ranges.remove(&s) {
            new_end = new_end.max(e);
        }
    }

    ranges.insert(new_start, new_end);
}
