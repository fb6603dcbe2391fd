//! 测试用 HTTP 服务器
//!
//! 普通请求/响应用 wiremock 模拟；需要中途断开或限速发送的场景使用
//! 这里的原始 TCP 服务器（每个连接只处理一个请求，Connection: close）

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archive_fetch::config::DownloadConfig;
use archive_fetch::{DownloadManager, ProgressCallback, ProgressUpdate, UrlResolver};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::{Respond, ResponseTemplate};

pub const MIB: usize = 1024 * 1024;

/// 收到的请求
#[derive(Debug, Clone)]
pub struct Request {
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Range: bytes=start-end
    pub fn range(&self) -> Option<(u64, Option<u64>)> {
        let value = self.header("range")?.strip_prefix("bytes=")?;
        let (start, end) = value.split_once('-')?;
        let start = start.parse().ok()?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse().ok()?)
        };
        Some((start, end))
    }
}

/// 响应
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// 只发送前 N 字节后断开
    pub truncate_after: Option<usize>,
    /// 每发送 64KB 等待的时间
    pub throttle: Option<Duration>,
    /// 发送前 N 字节后，每 64KB 额外等待的时间
    pub stall: Option<(usize, Duration)>,
}

impl Reply {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
            truncate_after: None,
            throttle: None,
            stall: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn redirect(location: &str) -> Self {
        Self::new(302, Vec::new()).header("Location", location)
    }

    pub fn html() -> Self {
        Self::new(200, b"<html><body>login required</body></html>".to_vec())
            .header("Content-Type", "text/html; charset=utf-8")
    }

    /// 按 Range 返回文件内容（206），没有 Range 时返回完整文件（200）
    pub fn file(data: &[u8], req: &Request) -> Self {
        let len = data.len() as u64;
        match req.range() {
            Some((start, end)) if start < len => {
                let end = end.unwrap_or(len - 1).min(len - 1);
                Self::new(206, data[start as usize..=end as usize].to_vec())
                    .header("Content-Type", "application/octet-stream")
                    .header("Content-Range", format!("bytes {}-{}/{}", start, end, len))
            }
            _ => Self::new(200, data.to_vec()).header("Content-Type", "application/octet-stream"),
        }
    }

    pub fn truncate_after(mut self, n: usize) -> Self {
        self.truncate_after = Some(n);
        self
    }

    pub fn throttle(mut self, delay: Duration) -> Self {
        self.throttle = Some(delay);
        self
    }

    pub fn stall_after(mut self, n: usize, delay: Duration) -> Self {
        self.stall = Some((n, delay));
        self
    }
}

pub type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

/// 测试服务器
pub struct TestServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Request>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl TestServer {
    pub async fn start(handler: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Self {
        let handler: Handler = Arc::new(handler);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (req_log, active_c, peak_c) = (requests.clone(), active.clone(), peak.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let req_log = req_log.clone();
                let active = active_c.clone();
                let peak = peak_c.clone();
                tokio::spawn(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    let _ = serve(stream, handler, req_log).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            requests,
            active,
            peak,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// 同一时刻的最大连接数
    pub fn peak_connections(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

async fn serve(
    mut stream: TcpStream,
    handler: Handler,
    req_log: Arc<Mutex<Vec<Request>>>,
) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    let text = String::from_utf8_lossy(&head).to_string();
    let mut lines = text.split("\r\n");
    let path = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let request = Request { path, headers };
    req_log.lock().push(request.clone());

    let reply = handler(&request);

    let mut response = format!("HTTP/1.1 {} Test\r\n", reply.status);
    for (k, v) in &reply.headers {
        response.push_str(&format!("{}: {}\r\n", k, v));
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        reply.body.len()
    ));
    stream.write_all(response.as_bytes()).await?;

    let limit = reply.truncate_after.unwrap_or(reply.body.len());
    let mut sent = 0;
    for piece in reply.body[..limit].chunks(64 * 1024) {
        stream.write_all(piece).await?;
        sent += piece.len();
        if let Some(delay) = reply.throttle {
            tokio::time::sleep(delay).await;
        }
        match reply.stall {
            Some((after, delay)) if sent >= after => tokio::time::sleep(delay).await,
            _ => {}
        }
    }
    stream.flush().await?;
    Ok(())
}

/// wiremock 响应：按 Range 返回文件内容（206），没有 Range 时返回完整文件（200）
pub struct RangeFile {
    data: Arc<Vec<u8>>,
    /// 不从 0 开始的 Range 请求返回该状态码
    reject_offset_status: Option<u16>,
}

impl RangeFile {
    pub fn new(data: Arc<Vec<u8>>) -> Self {
        Self {
            data,
            reject_offset_status: None,
        }
    }

    pub fn reject_offset(mut self, status: u16) -> Self {
        self.reject_offset_status = Some(status);
        self
    }
}

impl Respond for RangeFile {
    fn respond(&self, request: &wiremock::Request) -> ResponseTemplate {
        let headers = request
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let req = Request {
            path: request.url.path().to_string(),
            headers,
        };
        if let (Some(status), Some((start, _))) = (self.reject_offset_status, req.range()) {
            if start > 0 {
                return ResponseTemplate::new(status);
            }
        }

        let reply = Reply::file(&self.data, &req);
        let mut template = ResponseTemplate::new(reply.status);
        for (name, value) in reply.headers.iter().filter(|(k, _)| k != "Content-Type") {
            template = template.insert_header(name.as_str(), value.as_str());
        }
        template.set_body_raw(reply.body, "application/octet-stream")
    }
}

/// 确定性的测试数据
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn test_config(dir: &std::path::Path, max_workers: usize, max_chunks: usize) -> DownloadConfig {
    DownloadConfig {
        download_dir: dir.to_path_buf(),
        max_workers,
        max_chunks,
        read_timeout_secs: 5,
        ..Default::default()
    }
}

pub fn new_manager(config: &DownloadConfig) -> DownloadManager {
    DownloadManager::new(config, Arc::new(UrlResolver::new()), None).unwrap()
}

/// 记录所有进度通知
#[derive(Default)]
pub struct ProgressLog {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl ProgressLog {
    pub fn callback(self: &Arc<Self>) -> ProgressCallback {
        let log = self.clone();
        Arc::new(move |update| log.updates.lock().push(update))
    }

    /// 进度通知中出现过的最大分片数
    pub fn max_chunks(&self) -> usize {
        self.updates
            .lock()
            .iter()
            .filter_map(|u| u.chunks.as_ref().map(Vec::len))
            .max()
            .unwrap_or(0)
    }

    pub fn received(&self) -> u64 {
        self.updates.lock().last().map(|u| u.received).unwrap_or(0)
    }

    /// 进度通知中出现过的最大已接收字节数
    pub fn peak_received(&self) -> u64 {
        self.updates.lock().iter().map(|u| u.received).max().unwrap_or(0)
    }

    pub fn total(&self) -> Option<u64> {
        self.updates.lock().iter().rev().find_map(|u| u.total)
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(20), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
