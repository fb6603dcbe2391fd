//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod slow_worker_detector;

pub use slow_worker_detector::{SlowWorkerConfig, SlowWorkerDetector};
