use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use super::assembler::FileAssembler;
use super::chunk::{Chunk, ChunkDescriptor, ChunkState};
use crate::error::{DownloadError, Result};

/// 进度通知
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// 已写入字节数
    pub received: u64,
    /// 文件总大小（未知时为 None）
    pub total: Option<u64>,
    /// 所有分片的续传描述（仅在连续前缀前移时提供）
    pub chunks: Option<Vec<ChunkDescriptor>>,
    /// 输入链接
    pub urls: Option<Vec<String>>,
    /// 当前文件路径
    pub file_path: Option<PathBuf>,
}

/// 进度回调
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// 下载结果
#[derive(Debug, Clone)]
pub struct DownloadResult {
    /// 最终文件路径
    pub file_path: PathBuf,
    /// 最后一次响应的头部
    pub headers: HeaderMap,
    /// 中断后仍未完成的分片（可用于续传）
    pub unfinished_chunks: Vec<ChunkDescriptor>,
    /// 是否有分片提前结束
    pub had_errors: bool,
    /// 文件大小
    pub size: u64,
}

/// 一个下载
pub struct Download {
    /// 下载 ID（调用方提供）
    pub id: String,
    /// 输入链接
    pub urls: Arc<Vec<String>>,
    /// 原始文件名
    pub orig_name: String,
    /// 当前写入的路径
    pub temp_name: PathBuf,
    /// 服务器给出的最终路径
    pub final_name: Option<PathBuf>,
    /// 文件总大小
    pub size: Option<u64>,
    /// 已写入字节数
    pub received: u64,
    /// 分片列表
    pub chunks: Vec<Chunk>,
    /// 最后一次响应的头部
    pub headers: HeaderMap,
    /// 是否有分片提前结束
    pub error: bool,
    /// 下载开始时间
    pub started: DateTime<Utc>,
    /// 文件组装器（首次调度时创建）
    pub assembler: Option<Arc<FileAssembler>>,
    progress: Option<ProgressCallback>,
    result_tx: Option<oneshot::Sender<Result<DownloadResult>>>,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("id", &self.id)
            .field("temp_name", &self.temp_name)
            .field("size", &self.size)
            .field("received", &self.received)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

impl Download {
    pub fn new(
        id: String,
        urls: Vec<String>,
        orig_name: String,
        temp_name: PathBuf,
        progress: Option<ProgressCallback>,
        result_tx: oneshot::Sender<Result<DownloadResult>>,
    ) -> Self {
        Self {
            id,
            urls: Arc::new(urls),
            orig_name,
            temp_name,
            final_name: None,
            size: None,
            received: 0,
            chunks: Vec::new(),
            headers: HeaderMap::new(),
            error: false,
            started: Utc::now(),
            assembler: None,
            progress,
            result_tx: Some(result_tx),
        }
    }

    /// 是否还有等待调度或正在运行的分片
    pub fn has_active_chunks(&self) -> bool {
        self.chunks.iter().any(|c| c.is_active())
    }

    fn fallback_url(&self) -> &str {
        self.urls.first().map(String::as_str).unwrap_or_default()
    }

    /// 所有分片的描述（进度通知用）
    pub fn chunk_descriptors(&self) -> Vec<ChunkDescriptor> {
        let fallback = self.fallback_url();
        self.chunks.iter().map(|c| c.descriptor(fallback)).collect()
    }

    /// 可续传的分片描述
    pub fn unfinished_descriptors(&self) -> Vec<ChunkDescriptor> {
        let fallback = self.fallback_url();
        self.chunks
            .iter()
            .filter(|c| c.is_unfinished())
            .map(|c| c.descriptor(fallback))
            .collect()
    }

    /// 中断留下的分片（完成时放入结果）
    pub fn paused_descriptors(&self) -> Vec<ChunkDescriptor> {
        let fallback = self.fallback_url();
        self.chunks
            .iter()
            .filter(|c| c.state == ChunkState::Paused && c.is_unfinished())
            .map(|c| c.descriptor(fallback))
            .collect()
    }

    /// 已经存在于磁盘上的区间：总大小减去所有未完成分片的剩余范围
    pub fn written_ranges(&self) -> Vec<(u64, u64)> {
        let Some(size) = self.size else {
            return Vec::new();
        };

        let mut holes: Vec<(u64, u64)> = self
            .chunks
            .iter()
            .filter(|c| c.state != ChunkState::Finished && c.size > 0)
            .map(|c| (c.offset, (c.offset + c.size).min(size)))
            .collect();
        holes.sort();

        let mut ranges = Vec::new();
        let mut cursor = 0;
        for (start, end) in holes {
            if start > cursor {
                ranges.push((cursor, start));
            }
            cursor = cursor.max(end);
        }
        if cursor < size {
            ranges.push((cursor, size));
        }
        ranges
    }

    /// 发送进度通知
    pub fn emit_progress(
        &self,
        received: u64,
        total: Option<u64>,
        chunks: Option<Vec<ChunkDescriptor>>,
        urls: Option<Vec<String>>,
        file_path: Option<PathBuf>,
    ) {
        if let Some(cb) = &self.progress {
            cb(ProgressUpdate {
                received,
                total,
                chunks,
                urls,
                file_path,
            });
        }
    }

    /// 完成下载（只生效一次）
    pub fn resolve(&mut self, result: Result<DownloadResult>) {
        match self.result_tx.take() {
            Some(tx) => {
                if tx.send(result).is_err() {
                    debug!("下载 {} 的调用方已不再等待结果", self.id);
                }
            }
            None => debug!("下载 {} 已经有结果，忽略", self.id),
        }
    }

    /// 以错误结束
    pub fn fail(&mut self, err: DownloadError) {
        self.resolve(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::chunk::MIN_CHUNK_SIZE;
    use std::sync::Mutex;

    fn new_download() -> (Download, oneshot::Receiver<Result<DownloadResult>>) {
        let (tx, rx) = oneshot::channel();
        let download = Download::new(
            "d1".to_string(),
            vec!["http://example.com/a.zip".to_string()],
            "a.zip".to_string(),
            PathBuf::from("a.zip"),
            None,
            tx,
        );
        (download, rx)
    }

    #[test]
    fn test_resolve_only_once() {
        let (mut download, mut rx) = new_download();
        download.fail(DownloadError::NoUrls);
        download.fail(DownloadError::InvalidUrl("x".to_string()));

        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Err(DownloadError::NoUrls)));
    }

    #[test]
    fn test_written_ranges() {
        let (mut download, _rx) = new_download();
        download.size = Some(10 * MIN_CHUNK_SIZE);

        let mut first = Chunk::new(0, MIN_CHUNK_SIZE, false);
        first.state = ChunkState::Finished;
        first.size = 0;
        download.chunks.push(first);
        // 第二个分片剩余 [2MB, 4MB)
        download.chunks.push(Chunk::new(2 * MIN_CHUNK_SIZE, 2 * MIN_CHUNK_SIZE, false));
        // 第三个分片剩余 [8MB, 10MB)
        download.chunks.push(Chunk::new(8 * MIN_CHUNK_SIZE, 2 * MIN_CHUNK_SIZE, false));

        assert_eq!(
            download.written_ranges(),
            vec![(0, 2 * MIN_CHUNK_SIZE), (4 * MIN_CHUNK_SIZE, 8 * MIN_CHUNK_SIZE)]
        );
    }

    #[test]
    fn test_progress_callback() {
        let (tx, _rx) = oneshot::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let download = Download::new(
            "d2".to_string(),
            vec!["http://example.com/b.zip".to_string()],
            "b.zip".to_string(),
            PathBuf::from("b.zip"),
            Some(Arc::new(move |update: ProgressUpdate| {
                seen_clone.lock().unwrap().push(update.received);
            })),
            tx,
        );

        download.emit_progress(0, None, None, None, None);
        download.emit_progress(42, Some(100), None, None, None);
        assert_eq!(*seen.lock().unwrap(), vec![0, 42]);
    }

    #[test]
    fn test_paused_descriptors() {
        let (mut download, _rx) = new_download();
        let mut paused = Chunk::new(MIN_CHUNK_SIZE, 100, false);
        paused.state = ChunkState::Paused;
        download.chunks.push(paused);
        download.chunks.push(Chunk::new(0, 50, false));

        let descriptors = download.paused_descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].offset, MIN_CHUNK_SIZE);
        assert_eq!(descriptors[0].url, "http://example.com/a.zip");
        assert_eq!(download.unfinished_descriptors().len(), 2);
    }
}
