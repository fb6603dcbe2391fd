//! 速度统计
//!
//! 按 worker 统计每秒接收字节数，维护一个滑动窗口：
//! - 窗口未填满前不做判断
//! - 窗口内的平均速度低于该 worker 历史平均速度的 `starving_ratio` 倍时判定为"饥饿"

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use super::scheduler::WorkerId;

/// 速度计算器配置
#[derive(Debug, Clone)]
pub struct SpeedCalculatorConfig {
    /// 滑动窗口长度（秒）
    pub window_secs: u64,
    /// 饥饿判定比例
    pub starving_ratio: f64,
}

impl Default for SpeedCalculatorConfig {
    fn default() -> Self {
        Self {
            window_secs: 5,
            starving_ratio: 0.25,
        }
    }
}

#[derive(Debug)]
struct Counter {
    started: Instant,
    /// (相对 started 的秒数, 该秒内的字节数)
    buckets: VecDeque<(u64, u64)>,
    total: u64,
}

impl Counter {
    fn new(started: Instant) -> Self {
        Self {
            started,
            buckets: VecDeque::new(),
            total: 0,
        }
    }

    fn second_of(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started).as_secs()
    }

    fn record(&mut self, sec: u64, bytes: u64) {
        match self.buckets.back_mut() {
            Some((last, count)) if *last == sec => *count += bytes,
            _ => self.buckets.push_back((sec, bytes)),
        }
        self.total += bytes;
    }

    fn prune(&mut self, sec: u64, window: u64) {
        while let Some((first, _)) = self.buckets.front() {
            if first + window < sec {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// `[from, to)` 秒内的字节数
    fn bytes_between(&self, from: u64, to: u64) -> u64 {
        self.buckets
            .iter()
            .filter(|(s, _)| *s >= from && *s < to)
            .map(|(_, b)| *b)
            .sum()
    }
}

/// 速度计算器
#[derive(Debug)]
pub struct SpeedCalculator {
    config: SpeedCalculatorConfig,
    counters: HashMap<WorkerId, Counter>,
}

impl SpeedCalculator {
    pub fn new(config: SpeedCalculatorConfig) -> Self {
        Self {
            config,
            counters: HashMap::new(),
        }
    }

    fn window(&self) -> u64 {
        self.config.window_secs.max(1)
    }

    /// 开始统计一个 worker
    pub fn init_counter(&mut self, id: WorkerId) {
        self.init_counter_at(id, Instant::now());
    }

    pub fn init_counter_at(&mut self, id: WorkerId, now: Instant) {
        self.counters.insert(id, Counter::new(now));
    }

    /// 停止统计一个 worker
    pub fn stop_counter(&mut self, id: WorkerId) {
        self.counters.remove(&id);
    }

    /// 记录一次接收
    ///
    /// # 返回
    /// - `None`: 数据不足一个完整窗口
    /// - `Some(true)`: 近期速度明显低于历史速度
    /// - `Some(false)`: 速度正常
    pub fn add_measure(&mut self, id: WorkerId, bytes: u64) -> Option<bool> {
        self.add_measure_at(id, bytes, Instant::now())
    }

    pub fn add_measure_at(&mut self, id: WorkerId, bytes: u64, now: Instant) -> Option<bool> {
        let window = self.window();
        let ratio = self.config.starving_ratio;

        let counter = self
            .counters
            .entry(id)
            .or_insert_with(|| Counter::new(now));

        let sec = counter.second_of(now);

        // 当前秒尚未结束，只参与后续判断
        let completed_total = counter.total - counter.bytes_between(sec, u64::MAX);
        counter.record(sec, bytes);

        if sec < window {
            counter.prune(sec, window);
            return None;
        }

        let recent = counter.bytes_between(sec - window, sec) as f64 / window as f64;
        let long_run = completed_total as f64 / sec as f64;
        counter.prune(sec, window);

        Some(recent < long_run * ratio)
    }

    /// 所有活跃 worker 的总速度（字节/秒）
    pub fn total_speed(&self) -> u64 {
        self.total_speed_at(Instant::now())
    }

    pub fn total_speed_at(&self, now: Instant) -> u64 {
        let window = self.window();
        let bytes: u64 = self
            .counters
            .values()
            .map(|counter| {
                let sec = counter.second_of(now);
                counter.bytes_between(sec.saturating_sub(window), u64::MAX)
            })
            .sum();

        bytes / window
    }

    /// 活跃计数器数量
    pub fn active_counters(&self) -> usize {
        self.counters.len()
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(SpeedCalculatorConfig::default())
    }
}
