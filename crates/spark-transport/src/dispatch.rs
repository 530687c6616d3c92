use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error};

/// 投递给调度池的一次性任务。
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 调度池错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch pool is not running")]
    NotRunning,
    #[error("failed to spawn dispatch worker: {0}")]
    Spawn(String),
}

/// 外部提供的完成调度池。
///
/// # 契约说明（What）
/// - 线程数必须固定：引擎依赖“完成并发度有上限”来推导锁竞争与回调串行化的代价，
///   可增长的池会在 `Engine::initialize` 阶段被拒绝；
/// - `post` 可在任意线程调用，包括池自身的工作线程；
/// - 任务按投递顺序出队，但不同任务可能在不同线程上并行执行。
pub trait DispatchPool: Send + Sync + 'static {
    fn post(&self, job: Job) -> Result<(), DispatchError>;

    fn is_running(&self) -> bool;

    fn is_fixed_size(&self) -> bool;

    fn worker_count(&self) -> usize;
}

/// 固定线程数的参考调度池。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 引擎本身不创建线程，测试与进程内回环场景仍需要一个满足契约的调度池；
/// - 生产环境可用平台完成端口的线程池替换，只要实现 [`DispatchPool`]。
///
/// ## 逻辑（How）
/// - `parking_lot::Mutex<QueueState>` + `Condvar` 构成阻塞队列，工作线程空闲时在条件变量上等待；
/// - 任务以 `catch_unwind` 包裹，单个任务 panic 只记录日志，不会带走工作线程；
/// - `shutdown` 先拒绝新任务，再让工作线程排空已入队任务后退出并回收线程。
///
/// ## 风险与权衡（Trade-offs）
/// - 在工作线程内部调用 `shutdown` 时不会 join 自身，只等待其余线程退出。
pub struct FixedDispatchPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

struct PoolShared {
    queue: Mutex<QueueState>,
    ready: Condvar,
}

struct QueueState {
    jobs: VecDeque<Job>,
    running: bool,
}

impl FixedDispatchPool {
    /// 启动 `workers` 个工作线程；`workers` 为 0 时按 1 处理。
    pub fn new(workers: usize) -> Result<Self, DispatchError> {
        let size = workers.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                running: true,
            }),
            ready: Condvar::new(),
        });
        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("spark-dispatch-{index}"))
                .spawn(move || worker_loop(&worker_shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    shutdown_shared(&shared);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(DispatchError::Spawn(err.to_string()));
                }
            }
        }
        debug!(workers = size, "dispatch pool started");
        Ok(Self {
            shared,
            workers: Mutex::new(handles),
            size,
        })
    }

    /// 停止接收新任务，排空队列并回收工作线程。可重复调用。
    pub fn shutdown(&self) {
        shutdown_shared(&self.shared);
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl DispatchPool for FixedDispatchPool {
    fn post(&self, job: Job) -> Result<(), DispatchError> {
        let mut queue = self.shared.queue.lock();
        if !queue.running {
            return Err(DispatchError::NotRunning);
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.ready.notify_one();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.queue.lock().running
    }

    fn is_fixed_size(&self) -> bool {
        true
    }

    fn worker_count(&self) -> usize {
        self.size
    }
}

impl Drop for FixedDispatchPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn shutdown_shared(shared: &PoolShared) {
    shared.queue.lock().running = false;
    shared.ready.notify_all();
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if !queue.running {
                    break None;
                }
                shared.ready.wait(&mut queue);
            }
        };
        let Some(job) = job else {
            return;
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("dispatch job panicked; worker continues");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    };
    use std::time::Duration;

    #[test]
    fn jobs_run_on_workers() {
        let pool = FixedDispatchPool::new(2).expect("启动调度池失败");
        let (tx, rx) = mpsc::channel();
        for value in 0..8 {
            let tx = tx.clone();
            pool.post(Box::new(move || {
                let _ = tx.send(value);
            }))
            .expect("投递任务失败");
        }
        let mut seen: Vec<i32> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("等待任务超时"))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        assert!(pool.is_fixed_size());
        assert_eq!(pool.worker_count(), 2);
    }

    #[test]
    fn shutdown_drains_queue_and_rejects_new_jobs() {
        let pool = FixedDispatchPool::new(1).expect("启动调度池失败");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("投递任务失败");
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
        assert!(!pool.is_running());
        assert_eq!(
            pool.post(Box::new(|| {})).unwrap_err(),
            DispatchError::NotRunning
        );
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let pool = FixedDispatchPool::new(1).expect("启动调度池失败");
        pool.post(Box::new(|| panic!("boom"))).expect("投递任务失败");
        let (tx, rx) = mpsc::channel();
        pool.post(Box::new(move || {
            let _ = tx.send(());
        }))
        .expect("投递任务失败");
        rx.recv_timeout(Duration::from_secs(5))
            .expect("panic 之后工作线程应继续运行");
    }
}
