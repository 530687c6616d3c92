#![deny(unsafe_code)]
#![doc = r#"
# spark-conduit

## 设计动机（Why）
- 把“提交异步读写、稍后在调度池线程上收到完成”的底层模型，包装成面向连接的引擎：
  有序的读交付与写提交、出站背压、可选 TLS、协同关停；
- 上层协议（HTTP 等）只面对句柄与回调，不接触 Packet、序号或租约。

## 核心契约（What）
- [`Engine`]：`initialize` / `finalize` 括住全部连接活动；`attach` 接入链路并返回 [`ConnectionHandle`]；
  `send` / `send_stream` / `after_write_signal` 按调用顺序出站；`peek_received` / `consume_received`
  非阻塞读取接收缓冲；`pause_*` / `resume_*` 施加背压；`enable_tls` 就地升级；`close` 是唯一的取消原语；
- [`ConnectionHandler`]：`on_connect`、`on_data_received`（同一连接从不并发）、`on_disconnect`（恰好一次）、
  `on_destroy`；
- [`ConduitError`]：首个关闭错误被记录并可克隆分发，良性断开降级为成功。

## 实现策略（How）
- 读写各自以序号索引的有序结构排队，乱序完成被重新排序后才交付或提交；
- 每条连接一个打包状态字 + 显式租约计数，租约归零的线程执行销毁；
- 完成由外部固定大小的调度池驱动，引擎自身不创建线程。

## 风险与考量（Trade-offs）
- 接收缓冲不设上限，背压依赖调用方及时 `pause_input`；
- 回调中执行阻塞操作会占用调度池线程，进而拖慢其它连接的完成处理。
"#]

mod callbacks;
mod config;
mod connection;
mod engine;
mod error;
mod handle;
mod lifecycle;
mod read;
mod registry;
mod ring;
mod router;
mod state;
mod stats;
mod tls;
mod write;

pub use callbacks::{ConnectionContext, ConnectionHandler};
pub use config::{
    EngineConfig, EngineConfigBuilder, OUTGOING_CEILING_RANGE, PoolConfig, READ_AHEAD_RANGE,
};
pub use engine::{AttachOptions, Engine};
pub use error::ConduitError;
pub use handle::{ConnectionClass, ConnectionHandle};
pub use stats::ConnectionStats;

pub use spark_buffer::PoolStats;
pub use spark_transport::{AsyncLink, DispatchPool, FixedDispatchPool, MemoryLink};
pub use spark_transport_tls::{TlsError, TlsOptions, TrustFailure};
