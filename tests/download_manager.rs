mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archive_fetch::config::StarvationConfig;
use common::{new_manager, pattern, test_config, wait_until, ProgressLog, Reply, TestServer, MIB};
use tempfile::tempdir;

#[tokio::test]
async fn test_connection_reset_resumes_from_offset() {
    let data = Arc::new(pattern(3 * MIB));
    let reset_done = Arc::new(AtomicBool::new(false));
    let server = {
        let data = data.clone();
        let reset_done = reset_done.clone();
        TestServer::start(move |req| {
            let reply = Reply::file(&data, req);
            if req.range() == Some((0, Some(MIB as u64 - 1))) && !reset_done.swap(true, Ordering::SeqCst) {
                reply.truncate_after(512 * 1024)
            } else {
                reply
            }
        })
        .await
    };
    let dir = tempdir().unwrap();
    let manager = new_manager(&test_config(dir.path(), 1, 4));

    let result = manager
        .enqueue("reset", vec![server.url("/reset.bin")], None, None, None)
        .await
        .unwrap();

    assert!(!result.had_errors);
    assert_eq!(std::fs::read(&result.file_path).unwrap(), *data);
    assert!(server
        .requests()
        .iter()
        .any(|r| r.header("range") == Some("bytes=524288-1048575")));
}

#[tokio::test]
async fn test_reset_without_range_support_restarts_from_zero() {
    let data = Arc::new(pattern(3 * MIB));
    let reset_done = Arc::new(AtomicBool::new(false));
    let server = {
        let data = data.clone();
        let reset_done = reset_done.clone();
        TestServer::start(move |_| {
            let reply = Reply::new(200, data.to_vec()).header("Content-Type", "application/zip");
            if !reset_done.swap(true, Ordering::SeqCst) {
                reply.truncate_after(MIB)
            } else {
                reply
            }
        })
        .await
    };
    let dir = tempdir().unwrap();
    let manager = new_manager(&test_config(dir.path(), 1, 4));
    let log = Arc::new(ProgressLog::default());

    let result = manager
        .enqueue("rewind", vec![server.url("/whole.zip")], None, Some(log.callback()), None)
        .await
        .unwrap();

    assert!(!result.had_errors);
    assert_eq!(server.requests().len(), 2);
    // 第一次连接写入的字节不重复计入
    assert_eq!(result.size, 3 * MIB as u64);
    assert_eq!(log.received(), 3 * MIB as u64);
    assert!(log.peak_received() <= 3 * MIB as u64);
    assert_eq!(std::fs::read(&result.file_path).unwrap(), *data);
}

#[tokio::test]
async fn test_slow_worker_reconnects_from_offset() {
    let data = Arc::new(pattern(MIB));
    let stalled = Arc::new(AtomicBool::new(false));
    let server = {
        let data = data.clone();
        let stalled = stalled.clone();
        TestServer::start(move |req| {
            let reply = Reply::file(&data, req);
            if !stalled.swap(true, Ordering::SeqCst) {
                reply.stall_after(512 * 1024, Duration::from_millis(1200))
            } else {
                reply
            }
        })
        .await
    };
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path(), 1, 1);
    config.starvation = StarvationConfig {
        window_secs: 1,
        starving_ratio: 0.5,
        restart_after_samples: 1,
        restart_window_minutes: 15,
    };
    let manager = new_manager(&config);

    let result = manager
        .enqueue("slow", vec![server.url("/slow.bin")], None, None, None)
        .await
        .unwrap();

    assert!(!result.had_errors);
    assert_eq!(std::fs::read(&result.file_path).unwrap(), *data);

    let requests = server.requests();
    assert!(requests.len() >= 2, "requests {:?}", requests);
    let (start, end) = requests[1].range().unwrap();
    assert!(start > 0, "second request should continue from offset, got {}", start);
    assert_eq!(end, Some(MIB as u64 - 1));
}

#[tokio::test]
async fn test_pause_and_resume() {
    let data = Arc::new(pattern(8 * MIB));
    let server = {
        let data = data.clone();
        TestServer::start(move |req| {
            Reply::file(&data, req).throttle(Duration::from_millis(20))
        })
        .await
    };
    let dir = tempdir().unwrap();
    let manager = new_manager(&test_config(dir.path(), 4, 4));
    let log = Arc::new(ProgressLog::default());

    let task = {
        let manager = manager.clone();
        let urls = vec![server.url("/archive.7z")];
        let progress = log.callback();
        tokio::spawn(async move { manager.enqueue("p", urls, None, Some(progress), None).await })
    };

    wait_until(|| log.received() >= MIB as u64 && log.max_chunks() == 4).await;
    let descriptors = manager.pause("p").await.unwrap();

    // 暂停后下载正常结束，结果中带有剩余分片
    let paused = task.await.unwrap().unwrap();
    assert!(!paused.had_errors);
    assert_eq!(paused.unfinished_chunks, descriptors);
    assert_eq!(manager.active_worker_count().await, 0);
    assert!(manager.queued_downloads().await.is_empty());
    assert!(!descriptors.is_empty());
    assert!(descriptors.iter().all(|d| d.size > 0));

    // 描述之外的字节都已经正确写入
    let path: PathBuf = dir.path().join("archive.7z");
    let partial = std::fs::read(&path).unwrap();
    let missing: u64 = descriptors.iter().map(|d| d.size).sum();
    for (i, byte) in partial.iter().enumerate() {
        let i = i as u64;
        let pending = descriptors
            .iter()
            .any(|d| i >= d.offset && i < d.offset + d.size);
        if !pending {
            assert_eq!(*byte, data[i as usize], "byte {} differs", i);
        }
    }
    assert!(missing < data.len() as u64);

    let result = manager
        .resume(
            "p",
            path.clone(),
            vec![server.url("/archive.7z")],
            log.received(),
            log.total(),
            None,
            descriptors,
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.file_path, path);
    assert!(result.unfinished_chunks.is_empty());
    assert_eq!(std::fs::read(&path).unwrap(), *data);
}

#[tokio::test]
async fn test_stop_keeps_partial_file() {
    let data = Arc::new(pattern(4 * MIB));
    let server = {
        let data = data.clone();
        TestServer::start(move |req| Reply::file(&data, req).throttle(Duration::from_millis(50)))
            .await
    };
    let dir = tempdir().unwrap();
    let manager = new_manager(&test_config(dir.path(), 2, 2));
    let log = Arc::new(ProgressLog::default());

    let task = {
        let manager = manager.clone();
        let urls = vec![server.url("/stop.bin")];
        let progress = log.callback();
        tokio::spawn(async move { manager.enqueue("s", urls, None, Some(progress), None).await })
    };

    wait_until(|| log.received() > 0).await;
    assert!(manager.stop("s").await);
    assert!(!manager.stop("s").await);

    let stopped = task.await.unwrap().unwrap();
    assert!(stopped.had_errors);
    assert_eq!(stopped.file_path, dir.path().join("stop.bin"));
    assert_eq!(manager.active_worker_count().await, 0);
    assert!(dir.path().join("stop.bin").exists());
}
