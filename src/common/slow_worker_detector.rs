//! 慢速 worker 检测器
//!
//! 基于 SpeedCalculator 的饥饿判定决定是否重启某个 worker 的连接
//!
//! 核心机制：
//! 1. 每次接收数据时累计该 worker 的连续饥饿次数
//! 2. 速度恢复时清零
//! 3. 连续次数超过阈值且下载开始时间未超出重启窗口时，触发重启（同一分片、同一偏移）

use std::time::Duration;
use tracing::debug;

/// 慢速 worker 检测配置
#[derive(Clone, Debug)]
pub struct SlowWorkerConfig {
    /// 连续饥饿采样次数阈值
    pub restart_after_samples: u32,
    /// 允许重启的时间窗口（从下载开始计算），超出后链接可能已过期
    pub restart_window: Duration,
}

impl Default for SlowWorkerConfig {
    fn default() -> Self {
        Self {
            restart_after_samples: 15,
            restart_window: Duration::from_secs(15 * 60),
        }
    }
}

/// 慢速 worker 检测器
///
/// 不保存状态，计数存放在 worker 登记表中
#[derive(Debug, Clone, Default)]
pub struct SlowWorkerDetector {
    config: SlowWorkerConfig,
}

impl SlowWorkerDetector {
    pub fn new(config: SlowWorkerConfig) -> Self {
        Self { config }
    }

    /// 处理一次速度采样
    ///
    /// # 参数
    /// * `samples` - 该 worker 的连续饥饿计数
    /// * `starving` - SpeedCalculator 的判定结果
    /// * `download_age` - 下载已开始的时长
    ///
    /// # 返回
    /// - `true`: 应重启该 worker 的连接（计数已清零）
    /// - `false`: 不处理
    pub fn observe(&self, samples: &mut u32, starving: Option<bool>, download_age: Duration) -> bool {
        match starving {
            Some(true) => *samples += 1,
            Some(false) => *samples = 0,
            None => {}
        }

        if *samples > self.config.restart_after_samples && download_age < self.config.restart_window
        {
            debug!(
                "worker 连续 {} 次速度过低，下载已开始 {}秒，重启连接",
                samples,
                download_age.as_secs()
            );
            *samples = 0;
            return true;
        }

        false
    }
}
