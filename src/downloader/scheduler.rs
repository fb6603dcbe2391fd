//! worker 登记表
//!
//! 记录所有正在运行的 worker：所属下载、服务的分片以及饥饿计数。
//! 只由 DownloadManager 在持有自身锁时修改。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::worker::WorkerHandle;

/// worker 标识
///
/// 单调递增分配，不与下载 id、分片索引混用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// worker id 分配器
#[derive(Debug)]
pub struct WorkerIdAllocator {
    next_id: AtomicU64,
}

impl WorkerIdAllocator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// 分配一个新的 worker id
    pub fn allocate(&self) -> WorkerId {
        WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for WorkerIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// 登记表中的一个 worker
#[derive(Debug)]
pub struct WorkerSlot {
    /// 控制句柄
    pub handle: WorkerHandle,
    /// 所属下载
    pub download_id: String,
    /// 服务的分片索引
    pub chunk_index: usize,
    /// 连续饥饿采样次数
    pub starving_samples: u32,
}

/// worker 登记表
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    slots: HashMap<WorkerId, WorkerSlot>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: WorkerId, slot: WorkerSlot) {
        self.slots.insert(id, slot);
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerSlot> {
        self.slots.remove(&id)
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerSlot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerSlot> {
        self.slots.get_mut(&id)
    }

    /// 当前活跃 worker 数
    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    /// 在并发上限内还能启动多少 worker
    pub fn free_spots(&self, max_workers: usize) -> usize {
        max_workers.saturating_sub(self.slots.len())
    }

    /// 某个下载的所有 worker id（按分配顺序）
    pub fn ids_for(&self, download_id: &str) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.download_id == download_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// 移出某个下载的所有 worker
    pub fn take_for(&mut self, download_id: &str) -> Vec<(WorkerId, WorkerSlot)> {
        self.ids_for(download_id)
            .into_iter()
            .filter_map(|id| self.slots.remove(&id).map(|slot| (id, slot)))
            .collect()
    }
}
