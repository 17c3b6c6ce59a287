//! 复合键存储负载生成库
//!
//! 模拟大量并发虚拟用户，按重尾分布选择冷热键，对
//! “分区键 + 数值排序键”存储执行写入、窗口裁剪与窗口计数，
//! 并为每个逻辑操作上报延迟与结果。
//!
//! 特性：
//! - Zeta 分布拒绝采样选键，支持方向与偏移
//! - Jumbo 突发写入，压测宽分区
//! - 游标分页扫描 + 先扫后删的保留窗口裁剪
//! - 批量写入/删除变体
//! - 使用Compio异步运行时，线程内协作式调度虚拟用户

pub mod burst;
pub mod clock;
pub mod config;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod runner;
pub mod smoke;
pub mod store;
pub mod workload;
