//! `spark-buffer` 提供完成端口引擎使用的池化 I/O 缓冲（Packet）。
//!
//! # 模块定位（Why）
//! - 每一次异步读写、每一个内部控制事件都需要一块“随操作流转”的缓冲；
//!   若每次都向堆申请，连接数一多便会在分配器上形成热点。
//! - 本 crate 只负责“缓冲 + 元数据”的生命周期，不理解连接、TLS 或调度，
//!   因此可以被传输实现与引擎核心同时依赖而不产生环。
//!
//! # 设计概要（How）
//! - `packet` 模块定义 [`Packet`]：定长 `BytesMut` 存储 + 种类、序号、归属连接等元数据；
//! - `pool` 模块定义 [`PacketPool`]（进程级自由链表）与 [`LocalFreeList`]（连接级自由链表），
//!   两者均按 [`SizeClass`] 分两档，且仅对“空闲”链表设上限，在途 Packet 数量不设上限。
//!
//! # 命名约定（Consistency）
//! - `acquire`/`release` 与引擎其余部分的“租借/归还”术语保持一致。

mod packet;
mod pool;

pub use packet::{LARGE_PACKET_CAPACITY, Packet, PacketKind, SMALL_PACKET_CAPACITY, SizeClass};
pub use pool::{LocalFreeList, PacketPool, PoolLimits, PoolStats};
