use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::cookie::CookieStore;
use reqwest::header;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::fs;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::common::SlowWorkerDetector;
use crate::config::DownloadConfig;
use crate::downloader::assembler::FileAssembler;
use crate::downloader::chunk::{plan_split, Chunk, ChunkDescriptor, ChunkState, MIN_CHUNK_SIZE};
use crate::downloader::filename::{
    file_name_from_url, is_html_content_type, unused_name, DEFAULT_FILE_NAME,
};
use crate::downloader::progress::SpeedCalculator;
use crate::downloader::resolver::UrlResolver;
use crate::downloader::scheduler::{WorkerId, WorkerIdAllocator, WorkerRegistry, WorkerSlot};
use crate::downloader::task::{Download, DownloadResult, ProgressCallback};
use crate::downloader::worker::{
    DownloadWorker, WorkerContext, WorkerCursor, WorkerEvent, WorkerEventKind, WorkerJob,
    WorkerOutcome, WorkerStatus,
};
use crate::error::{DownloadError, Result};

/// 全局速度回调（字节/秒）
pub type SpeedCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// 中断方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Pause,
    Stop,
}

/// 未指定文件名且 URL 没有文件名时使用的名字
const DEFERRED_FILE_NAME: &str = "deferred";

/// 管理器内部状态，只在持有锁时修改
struct ManagerState {
    /// 下载队列（FIFO）
    queue: Vec<Download>,
    /// 活跃 worker
    registry: WorkerRegistry,
    /// 速度统计
    speed: SpeedCalculator,
    /// 默认下载目录
    download_dir: PathBuf,
    /// 全局最大 worker 数
    max_workers: usize,
    /// 单个文件最多分片数
    max_chunks: usize,
}

struct Shared {
    ctx: WorkerContext,
    ids: WorkerIdAllocator,
    slow: SlowWorkerDetector,
    speed_cb: parking_lot::RwLock<Option<SpeedCallback>>,
}

/// 下载管理器
///
/// 负责：
/// 1. 下载队列与全局 worker 并发上限
/// 2. 获取文件大小后拆分分片
/// 3. 重启速度过低的 worker
/// 4. 生成 / 接收续传描述
///
/// 可以廉价克隆，所有克隆共享同一个队列
#[derive(Clone)]
pub struct DownloadManager {
    state: Arc<Mutex<ManagerState>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager").finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// 创建下载管理器
    ///
    /// 会启动事件循环和速度上报两个后台任务，需要在 tokio 运行时内调用
    pub fn new(
        config: &DownloadConfig,
        resolver: Arc<UrlResolver>,
        cookies: Option<Arc<dyn CookieStore>>,
    ) -> anyhow::Result<Self> {
        config.validate().context("下载配置无效")?;

        // 重定向由 worker 自己处理（次数限制、记录重定向地址）
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.read_timeout())
            .tcp_nodelay(true)
            .build()
            .context("创建 HTTP 客户端失败")?;

        let (tx, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            ctx: WorkerContext {
                client,
                resolver,
                cookies,
                user_agent: config.user_agent.clone(),
                read_timeout: config.read_timeout(),
                events: tx,
            },
            ids: WorkerIdAllocator::new(),
            slow: SlowWorkerDetector::new(config.starvation.to_slow_worker_config()),
            speed_cb: parking_lot::RwLock::new(None),
        });

        let state = Arc::new(Mutex::new(ManagerState {
            queue: Vec::new(),
            registry: WorkerRegistry::new(),
            speed: SpeedCalculator::new(config.starvation.to_speed_config()),
            download_dir: config.download_dir.clone(),
            max_workers: config.max_workers,
            max_chunks: config.max_chunks,
        }));

        info!(
            "创建下载管理器: 下载目录={:?}, 最大worker数={}, 最大分片数={}",
            config.download_dir, config.max_workers, config.max_chunks
        );

        let manager = Self { state, shared };
        manager.start_event_loop(rx);
        manager.start_speed_reporter(config.speed_report_interval());

        Ok(manager)
    }

    /// 设置全局速度回调
    pub fn set_speed_callback(&self, cb: SpeedCallback) {
        *self.shared.speed_cb.write() = Some(cb);
    }

    /// 链接解析器（用于注册协议处理器）
    pub fn resolver(&self) -> Arc<UrlResolver> {
        self.shared.ctx.resolver.clone()
    }

    fn from_weak(state: &Weak<Mutex<ManagerState>>, shared: &Weak<Shared>) -> Option<Self> {
        Some(Self {
            state: state.upgrade()?,
            shared: shared.upgrade()?,
        })
    }

    /// 事件循环：串行处理所有 worker 事件
    fn start_event_loop(&self, mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
        let state = Arc::downgrade(&self.state);
        let shared = Arc::downgrade(&self.shared);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(manager) = Self::from_weak(&state, &shared) else {
                    break;
                };
                manager.handle_event(event).await;
            }
            debug!("下载管理器事件循环退出");
        });
    }

    /// 定时上报全局速度
    fn start_speed_reporter(&self, interval: std::time::Duration) {
        let state = Arc::downgrade(&self.state);
        let shared = Arc::downgrade(&self.shared);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(manager) = Self::from_weak(&state, &shared) else {
                    break;
                };
                let cb = manager.shared.speed_cb.read().clone();
                if let Some(cb) = cb {
                    let speed = manager.state.lock().await.speed.total_speed();
                    cb(speed);
                }
            }
        });
    }

    /// 新建下载
    ///
    /// 预留文件名后创建首个分片（前 1MB）并加入队列。
    /// 所有分片结束时返回结果（包括暂停、停止），只有失败时返回错误
    pub async fn enqueue(
        &self,
        id: impl Into<String>,
        urls: Vec<String>,
        file_name: Option<String>,
        progress: Option<ProgressCallback>,
        destination: Option<PathBuf>,
    ) -> Result<DownloadResult> {
        let id = id.into();
        if urls.is_empty() {
            return Err(DownloadError::NoUrls);
        }

        let name = match file_name.filter(|n| !n.trim().is_empty()) {
            Some(name) => name,
            None => {
                let url = Url::parse(&urls[0])
                    .map_err(|_| DownloadError::InvalidUrl(urls[0].clone()))?;
                file_name_from_url(&url).unwrap_or_else(|| DEFERRED_FILE_NAME.to_string())
            }
        };

        let dir = match destination {
            Some(dir) => dir,
            None => self.state.lock().await.download_dir.clone(),
        };
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::io(&dir, e))?;

        let path = unused_name(&dir, &name).await?;
        info!("新建下载 {}: {:?}", id, path);

        let (tx, rx) = oneshot::channel();
        let mut download = Download::new(id, urls, name, path.clone(), progress, tx);
        download.chunks.push(Chunk::new(0, MIN_CHUNK_SIZE, true));
        download.emit_progress(
            0,
            None,
            Some(download.chunk_descriptors()),
            None,
            Some(path.clone()),
        );

        self.admit(download).await;
        let result = wait_result(rx).await;

        if let Err(DownloadError::DownloadIsHtml { url }) = &result {
            // 下载到的是网页，不保留预留的文件
            warn!("下载内容是 HTML 页面，删除预留文件: {:?} ({})", path, url);
            if let Err(e) = fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("删除文件失败: {:?}, 错误: {}", path, e);
                }
            }
        }

        result
    }

    /// 从续传描述恢复下载
    #[allow(clippy::too_many_arguments)]
    pub async fn resume(
        &self,
        id: impl Into<String>,
        file_path: PathBuf,
        urls: Vec<String>,
        received: u64,
        size: Option<u64>,
        started: Option<DateTime<Utc>>,
        chunks: Vec<ChunkDescriptor>,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadResult> {
        let id = id.into();
        if chunks.is_empty() {
            return Err(DownloadError::ProcessCanceled(
                "No unfinished chunks".to_string(),
            ));
        }
        if urls.is_empty() {
            return Err(DownloadError::NoUrls);
        }

        // 部分文件可能已被删除，重新创建（不截断）
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&file_path)
            .await
            .map_err(|e| DownloadError::io(&file_path, e))?;

        let orig_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string());

        info!(
            "恢复下载 {}: {:?}, 已接收 {} bytes, 分片数 {}",
            id,
            file_path,
            received,
            chunks.len()
        );

        let (tx, rx) = oneshot::channel();
        let mut download = Download::new(id, urls, orig_name, file_path, progress, tx);
        download.received = received;
        download.size = size;
        if let Some(started) = started {
            download.started = started;
        }

        // 大小未知时每个分片的首个响应都要上报；否则只有尚未开始的首个分片上报
        let every_chunk_reports = size.is_none();
        for (i, desc) in chunks.iter().enumerate() {
            let reports = every_chunk_reports || (i == 0 && received == 0);
            download.chunks.push(Chunk::from_descriptor(desc, reports));
        }

        self.admit(download).await;
        wait_result(rx).await
    }

    async fn admit(&self, download: Download) {
        let mut state = self.state.lock().await;
        state.queue.push(download);
        self.tick(&mut state).await;
    }

    /// 停止下载
    ///
    /// 未运行的分片标记为完成，运行中的 worker 被取消，部分文件保留。
    /// 等待中的结果正常返回，`had_errors` 为 true，被取消的分片列在 `unfinished_chunks` 中
    pub async fn stop(&self, id: &str) -> bool {
        let stopped = self.interrupt(id, Interrupt::Stop).await.is_some();
        if stopped {
            info!("下载已停止: {}", id);
        }
        stopped
    }

    /// 暂停下载，返回可续传的分片描述
    ///
    /// 运行中的 worker 被暂停并等待其结束，因此返回的偏移是精确的。
    /// 等待中的结果同样正常返回，`unfinished_chunks` 与返回值一致
    pub async fn pause(&self, id: &str) -> Option<Vec<ChunkDescriptor>> {
        let descriptors = self.interrupt(id, Interrupt::Pause).await?;
        info!(
            "下载已暂停: {}, 未完成分片 {} 个",
            id,
            descriptors.len()
        );
        Some(descriptors)
    }

    /// 中断下载：移出队列，等待 worker 结束，按最终游标收尾并返回结果
    async fn interrupt(&self, id: &str, mode: Interrupt) -> Option<Vec<ChunkDescriptor>> {
        let (slots, mut download) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let idx = state.queue.iter().position(|d| d.id == id)?;
            let mut download = state.queue.remove(idx);

            for chunk in download.chunks.iter_mut() {
                match (mode, chunk.state) {
                    (Interrupt::Pause, ChunkState::Init) => chunk.state = ChunkState::Paused,
                    (Interrupt::Stop, ChunkState::Init | ChunkState::Paused) => {
                        chunk.state = ChunkState::Finished
                    }
                    _ => {}
                }
            }

            let slots = state.registry.take_for(id);
            for (worker_id, slot) in &slots {
                match mode {
                    Interrupt::Pause => slot.handle.pause(),
                    Interrupt::Stop => slot.handle.cancel(),
                }
                state.speed.stop_counter(*worker_id);
            }
            (slots, download)
        };

        // 已发出的写入在 worker 结束前完成，游标与磁盘一致
        for (_, slot) in slots {
            let chunk_index = slot.chunk_index;
            let cursor = slot.handle.join().await;
            if let Some(chunk) = download.chunks.get_mut(chunk_index) {
                if let Some(cursor) = cursor {
                    apply_cursor(chunk, &cursor);
                }
                chunk.worker_id = None;
                chunk.state = if chunk.size > 0 {
                    ChunkState::Paused
                } else {
                    ChunkState::Finished
                };
            }
        }

        if mode == Interrupt::Stop {
            download.error = true;
        }
        let descriptors = download.unfinished_descriptors();
        complete_download(download).await;

        let mut state = self.state.lock().await;
        self.tick(&mut state).await;
        Some(descriptors)
    }

    /// 设置默认下载目录（只影响之后新建的下载）
    pub async fn set_download_path(&self, path: PathBuf) {
        let mut state = self.state.lock().await;
        info!("更新下载目录: {:?} -> {:?}", state.download_dir, path);
        state.download_dir = path;
    }

    /// 动态调整全局最大 worker 数
    ///
    /// 调小时不打断运行中的 worker，调大时立即调度
    pub async fn set_max_concurrent_downloads(&self, n: usize) {
        let mut state = self.state.lock().await;
        let old = state.max_workers;
        state.max_workers = n.max(1);
        info!("🔧 动态调整最大worker数: {} -> {}", old, state.max_workers);
        self.tick(&mut state).await;
    }

    /// 当前活跃 worker 数
    pub async fn active_worker_count(&self) -> usize {
        self.state.lock().await.registry.active_count()
    }

    /// 队列中的下载 ID
    pub async fn queued_downloads(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .queue
            .iter()
            .map(|d| d.id.clone())
            .collect()
    }

    /// 某个下载的分片状态
    pub async fn chunk_states(&self, id: &str) -> Option<Vec<ChunkState>> {
        let state = self.state.lock().await;
        let download = state.queue.iter().find(|d| d.id == id)?;
        Some(download.chunks.iter().map(|c| c.state).collect())
    }

    /// 调度：在并发上限内按 FIFO 顺序启动等待中的分片
    async fn tick(&self, state: &mut ManagerState) {
        let mut free = state.registry.free_spots(state.max_workers);
        let mut idx = 0;

        while free > 0 && idx < state.queue.len() {
            if !state.queue[idx]
                .chunks
                .iter()
                .any(|c| c.state == ChunkState::Init)
            {
                idx += 1;
                continue;
            }

            if let Err(e) = Self::ensure_assembler(&mut state.queue[idx]).await {
                // 无法打开输出文件（例如被占用），整个下载失败，不再重试
                let mut download = state.queue.remove(idx);
                error!("启动下载失败 {}: {}", download.id, e);
                download.fail(e);
                continue;
            }

            let ManagerState {
                queue,
                registry,
                speed,
                ..
            } = &mut *state;
            let download = &mut queue[idx];

            while free > 0 {
                let Some(chunk_index) = download
                    .chunks
                    .iter()
                    .position(|c| c.state == ChunkState::Init)
                else {
                    break;
                };
                self.start_worker(download, chunk_index, registry, speed);
                free -= 1;
            }

            idx += 1;
        }
    }

    async fn ensure_assembler(download: &mut Download) -> Result<()> {
        if download.assembler.is_some() {
            return Ok(());
        }

        download.emit_progress(
            download.received,
            download.size,
            None,
            None,
            Some(download.temp_name.clone()),
        );

        let assembler = FileAssembler::open(&download.temp_name).await?;
        if let Some(size) = download.size {
            assembler.set_total_size(size).await?;
            for (start, end) in download.written_ranges() {
                assembler.mark_written(start, end).await;
            }
        }

        download.assembler = Some(Arc::new(assembler));
        Ok(())
    }

    fn start_worker(
        &self,
        download: &mut Download,
        chunk_index: usize,
        registry: &mut WorkerRegistry,
        speed: &mut SpeedCalculator,
    ) {
        let Some(assembler) = download.assembler.clone() else {
            return;
        };

        let worker_id = self.shared.ids.allocate();
        let chunk = &mut download.chunks[chunk_index];
        chunk.state = ChunkState::Running;
        chunk.worker_id = Some(worker_id);

        let job = WorkerJob {
            download_id: download.id.clone(),
            chunk_index,
            cursor: WorkerCursor {
                offset: chunk.offset,
                size: chunk.size,
                received: chunk.received,
                unbounded: chunk.unbounded,
            },
            resolved_url: chunk.resolved_url.clone(),
            urls: download.urls.clone(),
            assembler,
        };

        debug!(
            "启动 worker {}: 下载 {} 分片 #{}, offset={}, size={}",
            worker_id, download.id, chunk_index, job.cursor.offset, job.cursor.size
        );

        let handle = DownloadWorker::new(worker_id, self.shared.ctx.clone(), job).spawn();
        speed.init_counter(worker_id);
        registry.insert(
            worker_id,
            WorkerSlot {
                handle,
                download_id: download.id.clone(),
                chunk_index,
                starving_samples: 0,
            },
        );
    }

    async fn handle_event(&self, event: WorkerEvent) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let worker_id = event.worker_id;

        // 已被暂停 / 停止 / 取消的 worker 的事件直接忽略
        let Some(slot) = state.registry.get(worker_id) else {
            debug!("忽略已注销 worker {} 的事件", worker_id);
            return;
        };
        let chunk_index = slot.chunk_index;
        let Some(idx) = state.queue.iter().position(|d| d.id == slot.download_id) else {
            return;
        };

        match event.kind {
            WorkerEventKind::Received { bytes } => {
                self.on_received(state, idx, worker_id, bytes);
            }
            WorkerEventKind::Written {
                offset,
                len,
                synced,
            } => {
                on_written(&mut state.queue[idx], chunk_index, offset, len, synced);
            }
            WorkerEventKind::Rewound { discarded } => {
                on_rewound(&mut state.queue[idx], chunk_index, discarded);
            }
            WorkerEventKind::Redirected { url } => {
                if let Some(chunk) = state.queue[idx].chunks.get_mut(chunk_index) {
                    chunk.resolved_url = Some(url);
                }
            }
            WorkerEventKind::Response {
                size,
                file_name,
                url_file_name,
                headers,
                cursor,
            } => {
                let download = &mut state.queue[idx];
                download.headers = headers;
                let Some(chunk) = download.chunks.get_mut(chunk_index) else {
                    return;
                };
                chunk.offset = cursor.offset;
                chunk.size = cursor.size;
                chunk.unbounded = cursor.unbounded;
                if chunk.reports_response {
                    chunk.reports_response = false;
                    self.update_download(state, idx, size, file_name.or(url_file_name))
                        .await;
                }
            }
            WorkerEventKind::Finished(outcome) => {
                state.registry.remove(worker_id);
                state.speed.stop_counter(worker_id);
                self.finish_chunk(state, idx, chunk_index, outcome).await;
            }
        }
    }

    /// 速度采样，必要时重启慢速 worker
    fn on_received(&self, state: &mut ManagerState, idx: usize, worker_id: WorkerId, bytes: u64) {
        let starving = state.speed.add_measure(worker_id, bytes);
        let age = (Utc::now() - state.queue[idx].started)
            .to_std()
            .unwrap_or_default();

        if let Some(slot) = state.registry.get_mut(worker_id) {
            if self
                .shared
                .slow
                .observe(&mut slot.starving_samples, starving, age)
            {
                info!(
                    "⚠️ worker {} 速度过低，重启连接 (下载 {})",
                    worker_id, slot.download_id
                );
                slot.handle.restart();
            }
        }
    }

    /// 首个响应：改名、记录大小、拆分分片
    async fn update_download(
        &self,
        state: &mut ManagerState,
        idx: usize,
        size: Option<u64>,
        file_name: Option<String>,
    ) {
        let max_chunks = state.max_chunks;
        let max_workers = state.max_workers;
        let download = &mut state.queue[idx];

        if let Some(name) = file_name {
            if name != download.orig_name && download.final_name.is_none() {
                rename_download(download, &name).await;
            }
        }

        let Some(total) = size else {
            debug!("下载 {} 大小未知，不拆分分片", download.id);
            download.size = None;
            return;
        };

        if download.size != Some(total) {
            download.size = Some(total);
            if let Some(assembler) = &download.assembler {
                if let Err(e) = assembler.set_total_size(total).await {
                    warn!("预分配文件大小失败: {}", e);
                }
            }
        }

        if download.chunks.len() > 1 {
            return;
        }

        let ranges = plan_split(total, max_chunks, max_workers);
        if ranges.is_empty() {
            debug!("文件太小，不拆分: {:?}, {} bytes", download.temp_name, total);
            return;
        }

        for (offset, size) in &ranges {
            download.chunks.push(Chunk::new(*offset, *size, false));
        }
        info!(
            "下载 {} 拆分为 {} 个分片: 总大小 {} bytes",
            download.id,
            download.chunks.len(),
            total
        );

        // 链接可能有时效，尽快启动所有分片
        self.tick(state).await;
    }

    /// 分片结束
    async fn finish_chunk(
        &self,
        state: &mut ManagerState,
        idx: usize,
        chunk_index: usize,
        outcome: WorkerOutcome,
    ) {
        let download = &mut state.queue[idx];
        if let Some(chunk) = download.chunks.get_mut(chunk_index) {
            apply_cursor(chunk, &outcome.cursor);
            chunk.worker_id = None;
        }

        let interrupted = match outcome.status {
            WorkerStatus::Completed => false,
            WorkerStatus::Paused | WorkerStatus::Canceled => true,
            WorkerStatus::Failed(err) => {
                self.cancel_download(state, idx, err).await;
                self.tick(state).await;
                return;
            }
        };

        if let Some(chunk) = download.chunks.get_mut(chunk_index) {
            chunk.state = if interrupted || chunk.size > 0 {
                ChunkState::Paused
            } else {
                ChunkState::Finished
            };
            if !interrupted && chunk.size > 0 {
                warn!(
                    "下载 {} 分片 #{} 提前结束，剩余 {} bytes",
                    download.id, chunk_index, chunk.size
                );
                download.error = true;
            }
        }

        if !download.has_active_chunks() {
            let download = state.queue.remove(idx);
            complete_download(download).await;
        }

        self.tick(state).await;
    }

    /// 下载失败：取消其余分片，关闭文件，返回错误
    async fn cancel_download(&self, state: &mut ManagerState, idx: usize, err: DownloadError) {
        let mut download = state.queue.remove(idx);

        for chunk in download.chunks.iter_mut() {
            if chunk.state == ChunkState::Running {
                if let Some(worker_id) = chunk.worker_id.take() {
                    if let Some(slot) = state.registry.remove(worker_id) {
                        slot.handle.cancel();
                    }
                    state.speed.stop_counter(worker_id);
                }
                chunk.state = ChunkState::Paused;
            }
        }

        if let Some(assembler) = &download.assembler {
            if let Err(e) = assembler.close().await {
                warn!("关闭文件失败: {}", e);
            }
        }

        error!("下载失败 {}: {}", download.id, err);
        download.fail(err);
    }
}

async fn wait_result(rx: oneshot::Receiver<Result<DownloadResult>>) -> Result<DownloadResult> {
    rx.await.unwrap_or_else(|_| {
        Err(DownloadError::ProcessCanceled(
            "download dropped without result".to_string(),
        ))
    })
}

fn apply_cursor(chunk: &mut Chunk, cursor: &WorkerCursor) {
    chunk.offset = cursor.offset;
    chunk.size = cursor.size;
    chunk.received = cursor.received;
    chunk.unbounded = cursor.unbounded;
}

/// 写盘完成：更新分片和下载进度
fn on_written(download: &mut Download, chunk_index: usize, offset: u64, len: u64, synced: bool) {
    if let Some(chunk) = download.chunks.get_mut(chunk_index) {
        chunk.offset = offset + len;
        chunk.size = chunk.size.saturating_sub(len);
        chunk.received += len;
    }
    download.received += len;

    let chunks = synced.then(|| download.chunk_descriptors());
    download.emit_progress(
        download.received,
        download.size,
        chunks,
        Some(download.urls.to_vec()),
        Some(download.temp_name.clone()),
    );
}

/// 分片从头重新下载：回退已计入的字节
fn on_rewound(download: &mut Download, chunk_index: usize, discarded: u64) {
    if let Some(chunk) = download.chunks.get_mut(chunk_index) {
        chunk.offset = 0;
        chunk.size = chunk.size.saturating_add(discarded);
        chunk.received = chunk.received.saturating_sub(discarded);
    }
    download.received = download.received.saturating_sub(discarded);
}

/// 按服务器给出的文件名改名
async fn rename_download(download: &mut Download, name: &str) {
    let Some(assembler) = download.assembler.clone() else {
        return;
    };
    if assembler.is_closed() {
        return;
    }

    let dir = download
        .temp_name
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let new_path = match unused_name(&dir, name).await {
        Ok(path) => path,
        Err(e) => {
            error!("更新下载文件名失败: {}", e);
            return;
        }
    };

    match assembler.rename(&new_path).await {
        Ok(()) => {
            download.temp_name = new_path.clone();
            download.final_name = Some(new_path);
        }
        Err(e) => {
            error!("更新下载文件名失败: {}", e);
            let _ = fs::remove_file(&new_path).await;
        }
    }
}

/// 所有分片结束：关闭文件、改名、清理 HTML，返回汇总结果
async fn complete_download(mut download: Download) {
    match finalize_file(&download).await {
        Ok(file_path) => {
            let size = download.size.unwrap_or(0).max(download.received);
            let result = DownloadResult {
                file_path,
                headers: download.headers.clone(),
                unfinished_chunks: download.paused_descriptors(),
                had_errors: download.error,
                size,
            };
            info!(
                "✓ 下载结束 {}: {:?}, {} bytes, 未完成分片 {} 个",
                download.id,
                result.file_path,
                size,
                result.unfinished_chunks.len()
            );
            download.resolve(Ok(result));
        }
        Err(e) => {
            error!("完成下载失败 {}: {}", download.id, e);
            download.fail(e);
        }
    }
}

async fn finalize_file(download: &Download) -> Result<PathBuf> {
    if let Some(assembler) = &download.assembler {
        assembler.close().await?;
    }

    if let Some(final_name) = &download.final_name {
        download.emit_progress(
            download.size.unwrap_or(download.received),
            download.size,
            None,
            None,
            Some(final_name.clone()),
        );
        if *final_name != download.temp_name {
            debug!("重命名下载: {:?} -> {:?}", download.temp_name, final_name);
            fs::rename(&download.temp_name, final_name)
                .await
                .map_err(|e| DownloadError::io(final_name, e))?;
        }
        return Ok(final_name.clone());
    }

    let is_html = download
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(is_html_content_type)
        .unwrap_or(false);
    let temp_name = &download.temp_name;
    let is_html_file = temp_name
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("html"))
        .unwrap_or(false);

    if is_html && !is_html_file {
        // 不保留网页
        if let Err(e) = fs::remove_file(temp_name).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(DownloadError::io(temp_name, e));
            }
        }
    }

    Ok(temp_name.clone())
}
