#![deny(unsafe_code)]
#![doc = "spark-transport: 完成端口引擎的边界契约层。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：引擎只认识“提交操作、稍后在调度池线程上收到完成”这一抽象，IOCP、io_uring、epoll + 线程池都能满足；本 crate 把这条边界固定下来。"]
#![doc = "- **What**：[`AsyncLink`]（单条链路上的异步读写与拆除）、[`CompletionPort`]（完成回送入口）、[`DispatchPool`]（固定大小的外部调度池），以及参考实现 [`FixedDispatchPool`] 与进程内链路 [`MemoryLink`]。"]
#![doc = "- **How**：所有契约均为对象安全 trait，引擎以 `Arc<dyn _>` 持有，实现 crate 只需依赖本 crate 与 `spark-buffer`。"]

mod dispatch;
mod link;
mod memory;

pub use dispatch::{DispatchError, DispatchPool, FixedDispatchPool, Job};
pub use link::{AsyncLink, CompletionPort, Submission, TeardownMode};
pub use memory::MemoryLink;
