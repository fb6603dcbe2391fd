use anyhow::{bail, Context};
use archive_fetch::{
    config::AppConfig, logging, ChunkDescriptor, DownloadError, DownloadManager, DownloadResult,
    ProgressCallback, ProgressUpdate, UrlResolver,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 续传记录（Ctrl-C 时输出，`--resume` 时读取）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeEntry {
    id: String,
    urls: Vec<String>,
    file_path: PathBuf,
    received: u64,
    size: Option<u64>,
    started: DateTime<Utc>,
    chunks: Vec<ChunkDescriptor>,
}

/// 每个下载最近一次的进度
#[derive(Debug, Default, Clone)]
struct Snapshot {
    urls: Vec<String>,
    file_path: Option<PathBuf>,
    received: u64,
    size: Option<u64>,
    started: Option<DateTime<Utc>>,
}

type Snapshots = Arc<Mutex<HashMap<String, Snapshot>>>;

fn format_bytes(n: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", value, UNITS[unit])
}

fn progress_printer(
    id: String,
    urls: Vec<String>,
    started: DateTime<Utc>,
    snapshots: Snapshots,
) -> ProgressCallback {
    snapshots.lock().insert(
        id.clone(),
        Snapshot {
            urls,
            started: Some(started),
            ..Default::default()
        },
    );

    Arc::new(move |update: ProgressUpdate| {
        let mut snapshots = snapshots.lock();
        let snapshot = snapshots.entry(id.clone()).or_default();
        snapshot.received = update.received;
        snapshot.size = update.total;
        if let Some(path) = update.file_path {
            snapshot.file_path = Some(path);
        }

        match update.total {
            Some(total) if total > 0 => debug!(
                "[{}] {}/{} ({:.1}%)",
                id,
                format_bytes(update.received),
                format_bytes(total),
                update.received as f64 * 100.0 / total as f64
            ),
            _ => debug!("[{}] {}", id, format_bytes(update.received)),
        }
    })
}

fn report(id: &str, result: Result<DownloadResult, DownloadError>) {
    match result {
        Ok(result) => {
            if !result.unfinished_chunks.is_empty() && !result.had_errors {
                info!(
                    "⏸ [{}] 已暂停: {:?}, 剩余分片 {} 个",
                    id,
                    result.file_path,
                    result.unfinished_chunks.len()
                );
            } else if result.had_errors {
                warn!(
                    "⚠️ [{}] 下载不完整: {:?}, 未完成分片 {} 个",
                    id,
                    result.file_path,
                    result.unfinished_chunks.len()
                );
            } else {
                info!(
                    "✓ [{}] 下载完成: {:?} ({})",
                    id,
                    result.file_path,
                    format_bytes(result.size)
                );
            }
        }
        Err(e) => error!("[{}] 下载失败: {}", id, e),
    }
}

async fn load_resume_file(path: &str) -> anyhow::Result<Vec<ResumeEntry>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("读取续传文件失败: {}", path))?;
    serde_json::from_str(&content).with_context(|| format!("解析续传文件失败: {}", path))
}

/// 已接收字节数：大小已知时由剩余分片推算，否则取最近一次进度
fn received_bytes(size: Option<u64>, chunks: &[ChunkDescriptor], fallback: u64) -> u64 {
    match size {
        Some(size) => size.saturating_sub(chunks.iter().map(|c| c.size).sum()),
        None => fallback,
    }
}

/// Ctrl-C：暂停所有下载并输出续传记录
async fn pause_all(manager: &DownloadManager, snapshots: &Snapshots) -> anyhow::Result<()> {
    let mut entries = Vec::new();
    for id in manager.queued_downloads().await {
        let Some(chunks) = manager.pause(&id).await else {
            continue;
        };
        let snapshot = snapshots.lock().get(&id).cloned().unwrap_or_default();
        let (Some(file_path), false) = (snapshot.file_path, chunks.is_empty()) else {
            warn!("[{}] 无法续传（服务器不支持分段下载或尚未开始）", id);
            continue;
        };
        entries.push(ResumeEntry {
            id,
            urls: snapshot.urls,
            file_path,
            received: received_bytes(snapshot.size, &chunks, snapshot.received),
            size: snapshot.size,
            started: snapshot.started.unwrap_or_else(Utc::now),
            chunks,
        });
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&entries).context("序列化续传记录失败")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    let _log_guard = logging::init_logging(&config.log);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        bail!("用法: archive-fetch <URL>... | archive-fetch --resume <续传文件>");
    }

    info!("Archive Fetch v{}", env!("CARGO_PKG_VERSION"));

    let manager = DownloadManager::new(&config.download, Arc::new(UrlResolver::new()), None)
        .context("初始化下载管理器失败")?;
    manager.set_speed_callback(Arc::new(|speed| {
        if speed > 0 {
            info!("总速度: {}/s", format_bytes(speed));
        }
    }));

    let snapshots: Snapshots = Arc::new(Mutex::new(HashMap::new()));
    let mut tasks = JoinSet::new();

    if args[0] == "--resume" {
        let path = args.get(1).context("缺少续传文件路径")?;
        for entry in load_resume_file(path).await? {
            let manager = manager.clone();
            let progress = progress_printer(
                entry.id.clone(),
                entry.urls.clone(),
                entry.started,
                snapshots.clone(),
            );
            tasks.spawn(async move {
                let result = manager
                    .resume(
                        entry.id.clone(),
                        entry.file_path,
                        entry.urls,
                        entry.received,
                        entry.size,
                        Some(entry.started),
                        entry.chunks,
                        Some(progress),
                    )
                    .await;
                (entry.id, result)
            });
        }
    } else {
        for (i, url) in args.into_iter().enumerate() {
            let id = format!("dl-{}", i + 1);
            let manager = manager.clone();
            let urls = vec![url];
            let progress = progress_printer(id.clone(), urls.clone(), Utc::now(), snapshots.clone());
            tasks.spawn(async move {
                let result = manager.enqueue(id.clone(), urls, None, Some(progress), None).await;
                (id, result)
            });
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(Ok((id, result))) => report(&id, result),
                Some(Err(e)) => error!("下载任务异常退出: {}", e),
                None => break,
            },
            signal = &mut ctrl_c => {
                signal.context("监听 Ctrl-C 失败")?;
                info!("收到中断信号，暂停所有下载");
                pause_all(&manager, &snapshots).await?;
                while let Some(joined) = tasks.join_next().await {
                    if let Ok((id, result)) = joined {
                        report(&id, result);
                    }
                }
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(offset: u64, size: u64) -> ChunkDescriptor {
        ChunkDescriptor {
            url: "http://example.com/a.bin".to_string(),
            size,
            offset,
            received: 0,
        }
    }

    #[test]
    fn test_received_from_remaining_chunks() {
        let chunks = vec![desc(1000, 500), desc(3000, 1000)];
        assert_eq!(received_bytes(Some(4000), &chunks, 123), 2500);
        assert_eq!(received_bytes(Some(4000), &[], 123), 4000);
    }

    #[test]
    fn test_received_without_size_uses_snapshot() {
        assert_eq!(received_bytes(None, &[desc(0, 10)], 123), 123);
    }

    #[test]
    fn test_resume_entry_keeps_start_time() {
        let started = Utc::now() - chrono::Duration::minutes(30);
        let entry = ResumeEntry {
            id: "dl-1".to_string(),
            urls: vec!["http://example.com/a.bin".to_string()],
            file_path: PathBuf::from("/tmp/a.bin"),
            received: 10,
            size: Some(20),
            started,
            chunks: vec![desc(10, 10)],
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"started\""));
        let back: ResumeEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.started, started);
    }
}
