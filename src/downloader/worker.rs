//! 分片下载 worker
//!
//! 一个 worker 只负责一个分片：解析地址 → 发送 Range 请求 → 流式写入 FileAssembler。
//!
//! 状态流转：等待地址 → 请求中 → 接收数据 → {完成 | 出错 | 重定向}
//!
//! 与管理器之间只通过事件通道通信，worker 不持有 Download 本身

use bytes::BytesMut;
use futures::StreamExt;
use reqwest::cookie::CookieStore;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, Response, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::assembler::FileAssembler;
use super::filename::{file_name_from_url, is_html_content_type, parse_content_disposition};
use super::resolver::UrlResolver;
use super::scheduler::WorkerId;
use crate::error::{DownloadError, Result};

/// 每个 worker 最多跟随的重定向次数
pub const MAX_REDIRECT_FOLLOW: u32 = 2;
/// 缓冲达到该大小时开始写盘
pub const BUFFER_SIZE: usize = 256 * 1024;
/// 写盘未完成且缓冲超过该大小时暂停读取
pub const BUFFER_SIZE_CAP: usize = 4 * 1024 * 1024;
/// 跟随重定向前的等待时间
pub const REDIRECT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// worker 共享的运行环境
#[derive(Clone)]
pub struct WorkerContext {
    /// HTTP 客户端（不自动跟随重定向）
    pub client: Client,
    /// 链接解析器
    pub resolver: Arc<UrlResolver>,
    /// Cookie 来源
    pub cookies: Option<Arc<dyn CookieStore>>,
    /// User-Agent
    pub user_agent: String,
    /// 单次读取超时
    pub read_timeout: Duration,
    /// 事件通道
    pub events: mpsc::UnboundedSender<WorkerEvent>,
}

/// worker 持有的分片游标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCursor {
    pub offset: u64,
    pub size: u64,
    pub received: u64,
    pub unbounded: bool,
}

/// worker 结束状态
#[derive(Debug)]
pub enum WorkerStatus {
    /// 响应读取结束（剩余字节可能不为 0）
    Completed,
    /// 被暂停
    Paused,
    /// 被取消
    Canceled,
    /// 失败
    Failed(DownloadError),
}

/// worker 结束结果
#[derive(Debug)]
pub struct WorkerOutcome {
    pub cursor: WorkerCursor,
    pub status: WorkerStatus,
}

/// worker 发往管理器的事件
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker_id: WorkerId,
    pub kind: WorkerEventKind,
}

#[derive(Debug)]
pub enum WorkerEventKind {
    /// 收到数据（用于速度统计）
    Received { bytes: u64 },
    /// 一次写盘完成
    Written { offset: u64, len: u64, synced: bool },
    /// 首个有效响应
    Response {
        /// 文件总大小，不支持 Range 时为 None
        size: Option<u64>,
        /// Content-Disposition 给出的文件名
        file_name: Option<String>,
        /// URL 中的文件名
        url_file_name: Option<String>,
        headers: HeaderMap,
        /// 根据响应调整后的游标
        cursor: WorkerCursor,
    },
    /// 服务器不支持 Range，分片从 0 重新开始，之前写入的字节作废
    Rewound { discarded: u64 },
    /// 跟随了一次重定向
    Redirected { url: Url },
    /// worker 结束
    Finished(WorkerOutcome),
}

/// 分配给 worker 的任务
#[derive(Debug)]
pub struct WorkerJob {
    pub download_id: String,
    pub chunk_index: usize,
    pub cursor: WorkerCursor,
    /// 分片已知的重定向地址
    pub resolved_url: Option<Url>,
    /// 下载的输入链接
    pub urls: Arc<Vec<String>>,
    pub assembler: Arc<FileAssembler>,
}

/// worker 控制句柄
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    restart: Arc<Notify>,
    join: Option<JoinHandle<WorkerCursor>>,
}

impl WorkerHandle {
    /// 取消：中止请求，结果为"未暂停"
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 暂停：中止请求，结果为"已暂停"
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// 只断开当前连接并从当前偏移重连
    pub fn restart(&self) {
        self.restart.notify_one();
    }

    /// 等待 worker 结束，返回最终游标（已发出的写入都已完成）
    pub async fn join(mut self) -> Option<WorkerCursor> {
        match self.join.take() {
            Some(handle) => match handle.await {
                Ok(cursor) => Some(cursor),
                Err(e) => {
                    warn!("worker 任务异常退出: {}", e);
                    None
                }
            },
            None => None,
        }
    }
}

/// 单次连接的结果
enum Attempt {
    Done,
    Redirect(Url),
    Stopped,
    Restart,
    Error(DownloadError),
}

struct PendingWrite {
    offset: u64,
    len: u64,
    handle: JoinHandle<Result<bool>>,
}

/// 分片下载 worker
pub struct DownloadWorker {
    id: WorkerId,
    ctx: WorkerContext,
    download_id: String,
    chunk_index: usize,
    cursor: WorkerCursor,
    resolved_url: Option<Url>,
    urls: Arc<Vec<String>>,
    assembler: Arc<FileAssembler>,
    redirects: u32,
    reported: bool,
    /// 当前连接收到的字节数（决定出错时能否重试）
    connection_bytes: u64,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    restart: Arc<Notify>,
}

impl DownloadWorker {
    pub fn new(id: WorkerId, ctx: WorkerContext, job: WorkerJob) -> Self {
        Self {
            id,
            ctx,
            download_id: job.download_id,
            chunk_index: job.chunk_index,
            cursor: job.cursor,
            resolved_url: job.resolved_url,
            urls: job.urls,
            assembler: job.assembler,
            redirects: 0,
            reported: false,
            connection_bytes: 0,
            cancel: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
            restart: Arc::new(Notify::new()),
        }
    }

    /// 启动 worker 任务
    pub fn spawn(self) -> WorkerHandle {
        let mut handle = WorkerHandle {
            cancel: self.cancel.clone(),
            paused: self.paused.clone(),
            restart: self.restart.clone(),
            join: None,
        };
        handle.join = Some(tokio::spawn(self.run()));
        handle
    }

    async fn run(mut self) -> WorkerCursor {
        debug!(
            "[worker {}] 开始下载 {} 分片 #{}: offset={}, size={}",
            self.id, self.download_id, self.chunk_index, self.cursor.offset, self.cursor.size
        );

        let status = self.drive().await;
        let cursor = self.cursor;

        match &status {
            WorkerStatus::Failed(e) => {
                warn!("[worker {}] 分片 #{} 失败: {}", self.id, self.chunk_index, e)
            }
            other => debug!(
                "[worker {}] 分片 #{} 结束: {:?}, 剩余 {} bytes",
                self.id, self.chunk_index, other, cursor.size
            ),
        }

        self.emit(WorkerEventKind::Finished(WorkerOutcome { cursor, status }));
        cursor
    }

    fn emit(&self, kind: WorkerEventKind) {
        let _ = self.ctx.events.send(WorkerEvent {
            worker_id: self.id,
            kind,
        });
    }

    fn stopped_status(&self) -> WorkerStatus {
        if self.paused.load(Ordering::SeqCst) {
            WorkerStatus::Paused
        } else {
            WorkerStatus::Canceled
        }
    }

    async fn drive(&mut self) -> WorkerStatus {
        loop {
            let url = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.stopped_status(),
                url = self.current_url() => match url {
                    Ok(url) => url,
                    Err(e) => return WorkerStatus::Failed(e),
                },
            };

            self.connection_bytes = 0;
            match self.attempt(url).await {
                Attempt::Done => {
                    if self.cursor.unbounded {
                        self.cursor.size = 0;
                    }
                    return WorkerStatus::Completed;
                }
                Attempt::Redirect(next) => {
                    self.redirects += 1;
                    debug!(
                        "[worker {}] 跟随重定向 ({}/{}): {}",
                        self.id, self.redirects, MAX_REDIRECT_FOLLOW, next
                    );
                    self.resolved_url = Some(next.clone());
                    self.emit(WorkerEventKind::Redirected { url: next });
                }
                Attempt::Stopped => return self.stopped_status(),
                Attempt::Restart => {
                    info!(
                        "[worker {}] 重启连接，从 offset={} 继续",
                        self.id, self.cursor.offset
                    );
                }
                Attempt::Error(e) => {
                    if e.is_retryable() && self.connection_bytes > 0 {
                        warn!(
                            "[worker {}] 连接中断（已接收 {} bytes），从 offset={} 重试: {}",
                            self.id, self.connection_bytes, self.cursor.offset, e
                        );
                        continue;
                    }
                    return WorkerStatus::Failed(e);
                }
            }
        }
    }

    /// 分片的重定向地址，否则为下载的第一个解析地址
    async fn current_url(&self) -> Result<Url> {
        if let Some(url) = &self.resolved_url {
            return Ok(url.clone());
        }

        let first = self
            .ctx
            .resolver
            .resolve_all(&self.urls)
            .await
            .into_iter()
            .next()
            .ok_or_else(|| {
                DownloadError::ProcessCanceled("No URL found for this download".to_string())
            })?;

        let url = Url::parse(&first).map_err(|_| DownloadError::InvalidUrl(first.clone()))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(DownloadError::UnsupportedProtocol(other.to_string())),
        }
    }

    async fn attempt(&mut self, url: Url) -> Attempt {
        if !self.cursor.unbounded && self.cursor.size == 0 {
            return Attempt::Done;
        }
        if self.cursor.unbounded {
            // 不支持 Range，只能从头开始
            self.rewind();
        }

        let mut request = self
            .ctx
            .client
            .get(url.clone())
            .header(header::USER_AGENT, self.ctx.user_agent.as_str());

        if !self.cursor.unbounded {
            let last = self.cursor.offset + self.cursor.size - 1;
            request = request.header(
                header::RANGE,
                format!("bytes={}-{}", self.cursor.offset, last),
            );
        }

        if let Some(store) = &self.ctx.cookies {
            if let Some(cookie) = store.cookies(&url) {
                request = request.header(header::COOKIE, cookie);
            }
        }

        let send = tokio::time::timeout(self.ctx.read_timeout, request.send());
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Attempt::Stopped,
            _ = self.restart.notified() => return Attempt::Restart,
            res = send => match res {
                Err(_) => return Attempt::Error(DownloadError::Timeout { url: url.to_string() }),
                Ok(Err(e)) => return Attempt::Error(DownloadError::from_reqwest(e)),
                Ok(Ok(response)) => response,
            },
        };

        let status = response.status();
        if status.as_u16() >= 300 {
            return self.handle_status(&url, response).await;
        }

        let headers = response.headers().clone();
        if let Some(content_type) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            if is_html_content_type(content_type) {
                return Attempt::Error(DownloadError::DownloadIsHtml {
                    url: url.to_string(),
                });
            }
        }

        let content_length = response.content_length();
        let range = headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        let size = match range {
            None => {
                debug!(
                    "[worker {}] 服务器不支持 Range，下载完整文件: {}",
                    self.id, url
                );
                self.rewind();
                self.cursor.unbounded = true;
                self.cursor.size = content_length.unwrap_or(u64::MAX);
                None
            }
            Some(range) => {
                let total = range
                    .total
                    .or_else(|| content_length.map(|len| range.start + len));
                if let Some(total) = total {
                    if total < self.cursor.offset + self.cursor.size {
                        self.cursor.size = total.saturating_sub(self.cursor.offset);
                    }
                }
                total
            }
        };

        if !self.reported {
            self.reported = true;
            let file_name = headers
                .get(header::CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_disposition);
            self.emit(WorkerEventKind::Response {
                size,
                file_name,
                url_file_name: file_name_from_url(&url),
                headers,
                cursor: self.cursor,
            });
        }

        self.stream_body(&url, response).await
    }

    /// 回到文件开头重新下载，已写入的字节不再计入进度
    fn rewind(&mut self) {
        let discarded = self.cursor.offset;
        if discarded == 0 {
            return;
        }
        debug!(
            "[worker {}] 从头重新下载，丢弃已接收的 {} bytes",
            self.id, discarded
        );
        self.cursor.offset = 0;
        self.cursor.size = self.cursor.size.saturating_add(discarded);
        self.cursor.received = self.cursor.received.saturating_sub(discarded);
        self.emit(WorkerEventKind::Rewound { discarded });
    }

    /// 处理状态码 >= 300 的响应
    async fn handle_status(&self, url: &Url, response: Response) -> Attempt {
        let status = response.status();
        let is_redirect = status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND;

        if is_redirect && self.redirects < MAX_REDIRECT_FOLLOW {
            let next = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|location| url.join(location).ok());
            drop(response);

            let Some(next) = next else {
                return Attempt::Error(DownloadError::Http {
                    status: status.as_u16(),
                    message: "重定向缺少有效的 Location".to_string(),
                    url: url.to_string(),
                });
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Attempt::Stopped,
                _ = tokio::time::sleep(REDIRECT_SETTLE_DELAY) => {}
            }
            return Attempt::Redirect(next);
        }

        Attempt::Error(DownloadError::Http {
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or("").to_string(),
            url: url.to_string(),
        })
    }

    /// 读取响应体并写盘
    ///
    /// 缓冲超过 BUFFER_SIZE 时发起写盘，同时继续读取；
    /// 写盘未完成且缓冲超过 BUFFER_SIZE_CAP 时暂停读取
    async fn stream_body(&mut self, url: &Url, response: Response) -> Attempt {
        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
        let mut pending: Option<PendingWrite> = None;
        let mut ended = false;
        let mut stop: Option<Attempt> = None;

        loop {
            if should_flush(ended, pending.is_some(), buffer.len()) {
                pending = Some(self.issue_write(&mut buffer));
            }
            if ended && pending.is_none() {
                break;
            }

            let can_read = should_read(ended, pending.is_some(), buffer.len());

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    stop = Some(Attempt::Stopped);
                    break;
                }
                _ = self.restart.notified() => {
                    stop = Some(Attempt::Restart);
                    break;
                }
                res = wait_write(&mut pending), if pending.is_some() => {
                    pending = None;
                    if let Err(e) = self.complete_write(res) {
                        stop = Some(Attempt::Error(e));
                        break;
                    }
                }
                item = tokio::time::timeout(self.ctx.read_timeout, stream.next()), if can_read => {
                    match item {
                        Err(_) => {
                            stop = Some(Attempt::Error(DownloadError::Timeout { url: url.to_string() }));
                            break;
                        }
                        Ok(None) => ended = true,
                        Ok(Some(Err(e))) => {
                            stop = Some(Attempt::Error(DownloadError::from_reqwest(e)));
                            break;
                        }
                        Ok(Some(Ok(data))) => {
                            self.connection_bytes += data.len() as u64;

                            // 超出分片范围的数据丢弃
                            let room = if self.cursor.unbounded {
                                u64::MAX
                            } else {
                                self.cursor.size.saturating_sub(buffer.len() as u64)
                            };
                            let take = (data.len() as u64).min(room) as usize;
                            if take > 0 {
                                buffer.extend_from_slice(&data[..take]);
                                self.emit(WorkerEventKind::Received { bytes: take as u64 });
                            }
                            if !self.cursor.unbounded && self.cursor.size == buffer.len() as u64 {
                                ended = true;
                            }
                        }
                    }
                }
            }
        }

        let mut outcome = stop.unwrap_or(Attempt::Done);

        // 已发出的写入必须完成，剩余缓冲也写入，保证游标与磁盘一致
        let mut write_failed = false;
        if let Some(mut write) = pending.take() {
            let res = wait_write_inner(&mut write).await;
            if let Err(e) = self.complete_write(res) {
                write_failed = true;
                outcome = merge_write_error(outcome, e);
            }
        }
        if !write_failed && !buffer.is_empty() {
            let mut write = self.issue_write(&mut buffer);
            let res = wait_write_inner(&mut write).await;
            if let Err(e) = self.complete_write(res) {
                outcome = merge_write_error(outcome, e);
            }
        }

        outcome
    }

    /// 发起一次写盘，游标在发起时前移
    fn issue_write(&mut self, buffer: &mut BytesMut) -> PendingWrite {
        let data = buffer.split().freeze();
        let offset = self.cursor.offset;
        let len = data.len() as u64;

        self.cursor.offset += len;
        self.cursor.size = self.cursor.size.saturating_sub(len);
        self.cursor.received += len;

        let assembler = self.assembler.clone();
        let handle = tokio::spawn(async move { assembler.add_chunk(offset, &data).await });

        PendingWrite {
            offset,
            len,
            handle,
        }
    }

    /// 写盘完成：成功则上报，失败则回退游标
    fn complete_write(&mut self, (offset, len, res): (u64, u64, Result<bool>)) -> Result<()> {
        match res {
            Ok(synced) => {
                self.emit(WorkerEventKind::Written {
                    offset,
                    len,
                    synced,
                });
                Ok(())
            }
            Err(e) => {
                self.cursor.offset -= len;
                self.cursor.size = self.cursor.size.saturating_add(len);
                self.cursor.received -= len;
                Err(e)
            }
        }
    }
}

/// 同一时刻只有一个写盘请求；缓冲满 BUFFER_SIZE 或响应结束时发起
fn should_flush(ended: bool, write_pending: bool, buffered: usize) -> bool {
    !write_pending && buffered > 0 && (ended || buffered >= BUFFER_SIZE)
}

/// 写盘跟不上时缓冲达到 BUFFER_SIZE_CAP 后停止读取
fn should_read(ended: bool, write_pending: bool, buffered: usize) -> bool {
    !ended && !(write_pending && buffered >= BUFFER_SIZE_CAP)
}

async fn wait_write(pending: &mut Option<PendingWrite>) -> (u64, u64, Result<bool>) {
    match pending {
        Some(write) => wait_write_inner(write).await,
        None => std::future::pending().await,
    }
}

async fn wait_write_inner(write: &mut PendingWrite) -> (u64, u64, Result<bool>) {
    let res = match (&mut write.handle).await {
        Ok(res) => res,
        Err(e) => Err(DownloadError::ProcessCanceled(format!("写盘任务异常: {}", e))),
    };
    (write.offset, write.len, res)
}

/// 停止请求优先于写盘错误；其他情况保留第一个错误
fn merge_write_error(outcome: Attempt, err: DownloadError) -> Attempt {
    match outcome {
        Attempt::Stopped => Attempt::Stopped,
        Attempt::Error(first) => Attempt::Error(first),
        _ => Attempt::Error(err),
    }
}

/// Content-Range: bytes start-end/total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    start: u64,
    end: u64,
    total: Option<u64>,
}

fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim().parse().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some(ContentRange { start, end, total })
}
