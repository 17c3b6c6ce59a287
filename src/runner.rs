//! 虚拟用户与调度
//!
//! 用户分布在若干工作线程上，每个线程一个 compio 运行时，
//! 线程内的用户通过 `join_all` 协作式并发。每个用户一次只执行一个完整操作。

use crate::clock::Clock;
use crate::config::{RunConfig, TaskMix, WorkloadConfig, messages};
use crate::error::{AppError, Result};
use crate::keys::KeySelector;
use crate::metrics::MetricsSink;
use crate::store::Store;
use crate::workload::Workload;
use futures_util::future::join_all;
use rand::distr::weighted::WeightedIndex;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// 任务类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Task {
    Add,
    AddBatch,
    Count,
}

impl Task {
    const ALL: [Task; 3] = [Task::Add, Task::AddBatch, Task::Count];
}

/// 按权重随机挑选任务
#[derive(Debug, Clone)]
pub struct TaskPicker {
    weights: WeightedIndex<u32>,
}

impl TaskPicker {
    pub fn new(mix: TaskMix) -> Result<Self> {
        let weights = WeightedIndex::new([mix.add, mix.add_batch, mix.count])
            .map_err(|e| AppError::Config(format!("invalid task weights: {e}")))?;
        Ok(Self { weights })
    }

    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Task {
        Task::ALL[self.weights.sample(rng)]
    }
}

/// 每类任务完成的次数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub add: u64,
    pub add_batch: u64,
    pub count: u64,
}

impl TaskCounts {
    pub fn total(&self) -> u64 {
        self.add + self.add_batch + self.count
    }

    fn bump(&mut self, task: Task) {
        match task {
            Task::Add => self.add += 1,
            Task::AddBatch => self.add_batch += 1,
            Task::Count => self.count += 1,
        }
    }

    fn merge(&mut self, other: TaskCounts) {
        self.add += other.add;
        self.add_batch += other.add_batch;
        self.count += other.count;
    }
}

/// 运行级停止条件：截止时间或显式中止
#[derive(Debug)]
pub struct StopSignal {
    deadline: Option<Instant>,
    halted: AtomicBool,
}

impl StopSignal {
    pub fn new(duration: Option<Duration>) -> Self {
        Self {
            deadline: duration.map(|d| Instant::now() + d),
            halted: AtomicBool::new(false),
        }
    }

    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn should_stop(&self) -> bool {
        self.is_halted() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// 让出一次调度，使同一运行时上的其他用户有机会推进
struct YieldNow(bool);

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// 一个虚拟用户
pub struct VirtualUser<'a, S: Store> {
    id: usize,
    workload: Workload<'a, S>,
    picker: TaskPicker,
    rng: ChaCha8Rng,
    iterations: Option<u64>,
    stop: &'a StopSignal,
}

impl<'a, S: Store> VirtualUser<'a, S> {
    pub fn new(
        id: usize,
        workload: Workload<'a, S>,
        picker: TaskPicker,
        rng: ChaCha8Rng,
        iterations: Option<u64>,
        stop: &'a StopSignal,
    ) -> Self {
        Self {
            id,
            workload,
            picker,
            rng,
            iterations,
            stop,
        }
    }

    /// 反复执行任务直到达到迭代上限、截止时间或被中止
    pub async fn run(mut self) -> Result<TaskCounts> {
        let mut counts = TaskCounts::default();
        while !self.stop.should_stop() {
            if self.iterations.is_some_and(|limit| counts.total() >= limit) {
                break;
            }
            let task = self.picker.pick(&mut self.rng);
            if let Err(err) = self.run_task(task).await {
                tracing::warn!(user = self.id, ?task, error = %err, "virtual user stopped");
                self.stop.halt();
                return Err(err);
            }
            counts.bump(task);
            YieldNow(false).await;
        }
        Ok(counts)
    }

    pub async fn run_task(&mut self, task: Task) -> Result<()> {
        match task {
            Task::Add => self.workload.add().await,
            Task::AddBatch => self.workload.add_batch().await,
            Task::Count => self.workload.count().await.map(|_| ()),
        }
    }
}

/// 运行报告
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub users: usize,
    pub counts: TaskCounts,
    pub elapsed: Duration,
}

/// 负载运行器
pub struct Runner<'a, S: Store> {
    workload: &'a WorkloadConfig,
    run: &'a RunConfig,
    store: &'a S,
    sink: &'a dyn MetricsSink,
    clock: &'a dyn Clock,
}

impl<'a, S: Store> Runner<'a, S> {
    pub fn new(
        workload: &'a WorkloadConfig,
        run: &'a RunConfig,
        store: &'a S,
        sink: &'a dyn MetricsSink,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            workload,
            run,
            store,
            sink,
            clock,
        }
    }

    /// 运行到全部用户结束；返回第一个致命错误
    pub fn run(&self) -> Result<RunReport> {
        self.run.validate()?;
        self.workload.validate()?;
        // 分布参数在启动时检查，而不是在第一次采样时
        KeySelector::new(self.workload)?;
        let picker = TaskPicker::new(self.run.mix)?;

        let seed = self.run.seed.unwrap_or_else(|| rand::rng().random());
        let stop = StopSignal::new(self.run.duration);
        let threads = self.run.threads.min(self.run.users);
        tracing::info!(
            users = self.run.users,
            threads,
            seed,
            duration = ?self.run.duration,
            iterations = ?self.run.iterations,
            "starting virtual users"
        );

        let started = Instant::now();
        let results: Vec<Result<TaskCounts>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|worker| {
                    let stop = &stop;
                    let picker = picker.clone();
                    std::thread::Builder::new()
                        .name(format!("kv-worker-{worker}"))
                        .spawn_scoped(scope, move || {
                            self.run_worker(worker, threads, seed, picker, stop)
                        })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        stop.halt();
                        Err(AppError::RuntimeCreate("worker thread panicked".into()))
                    }),
                    Err(err) => {
                        stop.halt();
                        Err(AppError::from(err))
                    }
                })
                .collect()
        });

        let mut counts = TaskCounts::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(worker_counts) => counts.merge(worker_counts),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        let report = RunReport {
            users: self.run.users,
            counts,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            add = counts.add,
            add_batch = counts.add_batch,
            count = counts.count,
            elapsed = ?report.elapsed,
            "virtual users finished"
        );
        Ok(report)
    }

    fn run_worker(
        &self,
        worker: usize,
        threads: usize,
        seed: u64,
        picker: TaskPicker,
        stop: &StopSignal,
    ) -> Result<TaskCounts> {
        let runtime = compio::runtime::Runtime::new().map_err(|e| {
            AppError::RuntimeCreate(format!("{}: {e}", messages::RUNTIME_CREATE_FAILED))
        })?;
        let users = (worker..self.run.users)
            .step_by(threads)
            .map(|id| -> Result<VirtualUser<'_, S>> {
                let workload = Workload::new(
                    self.workload,
                    self.store,
                    self.sink,
                    self.clock,
                    user_rng(seed, id, 0),
                )?;
                Ok(VirtualUser::new(
                    id,
                    workload,
                    picker.clone(),
                    user_rng(seed, id, 1),
                    self.run.iterations,
                    stop,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let runs = users.into_iter().map(VirtualUser::run);
        let results = runtime.block_on(join_all(runs));
        let mut counts = TaskCounts::default();
        for result in results {
            counts.merge(result?);
        }
        Ok(counts)
    }
}

/// 每个用户、每种用途一条独立的可复现随机流
fn user_rng(seed: u64, user: usize, purpose: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(((user as u64) << 1) | purpose);
    rng
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picker_respects_zero_weights() {
        let picker = TaskPicker::new(TaskMix {
            add: 0,
            add_batch: 0,
            count: 3,
        })
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!((0..100).all(|_| picker.pick(&mut rng) == Task::Count));
        assert!(
            TaskPicker::new(TaskMix {
                add: 0,
                add_batch: 0,
                count: 0
            })
            .is_err()
        );
    }

    #[test]
    fn stop_signal_deadline_and_halt() {
        let stop = StopSignal::new(None);
        assert!(!stop.should_stop());
        stop.halt();
        assert!(stop.should_stop());
        assert!(StopSignal::new(Some(Duration::ZERO)).should_stop());
    }

    #[test]
    fn user_streams_are_reproducible_and_distinct() {
        let a: u64 = user_rng(7, 3, 0).random();
        let b: u64 = user_rng(7, 3, 0).random();
        let c: u64 = user_rng(7, 4, 0).random();
        let d: u64 = user_rng(7, 3, 1).random();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
