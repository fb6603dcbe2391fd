use serde::{Deserialize, Serialize};
use url::Url;

use super::scheduler::WorkerId;

/// 最小分片大小: 1MB
///
/// 首个分片只覆盖前 1MB；不超过该大小的文件不会拆分
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// 等待调度
    Init,
    /// 已分配 worker，正在下载
    Running,
    /// 被中断且仍有剩余字节（可续传）
    Paused,
    /// 已完成（或被 stop 放弃）
    Finished,
}

/// 分片信息
#[derive(Debug, Clone)]
pub struct Chunk {
    /// 当前起始偏移（随数据写入前移）
    pub offset: u64,
    /// 剩余待下载字节数
    pub size: u64,
    /// 本分片已接收字节数
    pub received: u64,
    /// 状态
    pub state: ChunkState,
    /// 正在服务该分片的 worker
    pub worker_id: Option<WorkerId>,
    /// 重定向后得到的地址，下次请求优先使用
    pub resolved_url: Option<Url>,
    /// 首个响应是否需要上报（用于获取文件大小 / 文件名并触发拆分）
    pub reports_response: bool,
    /// 服务器不支持 Range，本分片下载完整响应体
    pub unbounded: bool,
}

impl Chunk {
    pub fn new(offset: u64, size: u64, reports_response: bool) -> Self {
        Self {
            offset,
            size,
            received: 0,
            state: ChunkState::Init,
            worker_id: None,
            resolved_url: None,
            reports_response,
            unbounded: false,
        }
    }

    /// 从续传描述恢复分片
    pub fn from_descriptor(desc: &ChunkDescriptor, reports_response: bool) -> Self {
        Self {
            received: desc.received,
            ..Self::new(desc.offset, desc.size, reports_response)
        }
    }

    /// 是否仍需要调度或正在执行
    pub fn is_active(&self) -> bool {
        matches!(self.state, ChunkState::Init | ChunkState::Running)
    }

    /// 是否未完成（可出现在续传描述中）
    pub fn is_unfinished(&self) -> bool {
        self.state != ChunkState::Finished && self.size > 0 && !self.unbounded
    }

    /// 当前剩余范围的最后一个字节（含）
    pub fn last_byte(&self) -> Option<u64> {
        if self.size == 0 {
            None
        } else {
            Some(self.offset + self.size - 1)
        }
    }

    /// 生成续传描述
    ///
    /// `fallback_url` 为下载的第一个输入链接，分片没有重定向地址时使用
    pub fn descriptor(&self, fallback_url: &str) -> ChunkDescriptor {
        ChunkDescriptor {
            url: self
                .resolved_url
                .as_ref()
                .map(|u| u.to_string())
                .unwrap_or_else(|| fallback_url.to_string()),
            size: self.size,
            offset: self.offset,
            received: self.received,
        }
    }
}

/// 续传描述（持久化格式）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub url: String,
    pub size: u64,
    pub offset: u64,
    pub received: u64,
}

/// 计算首个响应之后追加的分片 `(offset, size)`
///
/// 下载总分片数为 `min(max_chunks, max_workers)`，首个分片已占用 `[0, MIN_CHUNK_SIZE)`，
/// 剩余部分均分为 `max(1, n - 1)` 份，每份至少 `MIN_CHUNK_SIZE`，最后一份可以更短
pub fn plan_split(total_size: u64, max_chunks: usize, max_workers: usize) -> Vec<(u64, u64)> {
    if total_size <= MIN_CHUNK_SIZE {
        return Vec::new();
    }

    let total_chunks = max_chunks.min(max_workers).max(1) as u64;
    let pieces = total_chunks.saturating_sub(1).max(1);
    let remaining = total_size - MIN_CHUNK_SIZE;
    let piece_size = remaining.div_ceil(pieces).max(MIN_CHUNK_SIZE);

    let mut ranges = Vec::new();
    let mut offset = MIN_CHUNK_SIZE;
    while offset < total_size {
        let size = piece_size.min(total_size - offset);
        ranges.push((offset, size));
        offset += size;
    }

    ranges
}
