use std::{borrow::Cow, io, sync::Arc};

use spark_buffer::Packet;

/// 链路拆除方式。
///
/// - `Graceful`：半关闭写方向，对端随后读到流结束；
/// - `Abortive`：立即复位，对端读到连接重置。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownMode {
    Graceful,
    Abortive,
}

/// 一次提交的即时结果。
///
/// # 契约说明（What）
/// - `Pending`：操作已被链路接管，稍后**恰好一次**经由 [`CompletionPort::complete`] 回送；
/// - `Completed`：操作在提交时已同步完成，Packet 立即交还，`transferred` 为实际传输字节数；
/// - `WouldBlock`：仅用于写，链路暂时无法接收更多字节，调用方稍后重试；
/// - `EndOfStream`：仅用于读，对端已优雅关闭；
/// - `Failed`：提交即失败，携带底层 I/O 错误。
///
/// 除 `Pending` 外，Packet 的所有权都随结果返还给调用方。
#[derive(Debug)]
pub enum Submission {
    Pending,
    Completed { packet: Packet, transferred: usize },
    WouldBlock(Packet),
    EndOfStream(Packet),
    Failed { packet: Packet, error: io::Error },
}

/// 完成回送入口。
///
/// # 意图（Why）
/// - 链路实现不关心完成会被投递到哪个线程、由谁处理；它只需把 Packet 与结果交回来。
///
/// # 契约（What）
/// - `result` 为 `Ok(n)` 时，读操作的 Packet 已通过 `set_len(n)` 标记有效字节；
/// - 实现必须可在任意线程、包括链路自身的回调线程中调用，不得阻塞等待引擎内部锁。
pub trait CompletionPort: Send + Sync + 'static {
    fn complete(&self, packet: Packet, result: io::Result<usize>);
}

/// 单条已建立链路上的异步读写原语。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 真正发起异步读写的是平台相关的套接字 / 命名管道实现，引擎把它们视为外部协作者；
/// - 统一成“提交 + 完成回送”的形态后，读写流水线的排序、背压与关停逻辑与平台无关。
///
/// ## 契约（What）
/// - `submit_read`：Packet 为 `ZeroByteProbe` 时，链路应在“有数据可读”时以 `Ok(0)` 完成且不消费数据；
/// - `submit_write`：写入 `packet.filled()` 的全部字节；完成字节数小于请求长度视为写故障；
/// - `WouldBlock` 只允许在链路上仍有其它写操作在途时返回，以保证后续完成能够重新驱动写队列；
/// - `teardown`：必须让所有仍处于 `Pending` 的操作以错误完成，之后的提交直接失败；可重复调用。
///
/// ## 风险与权衡（Trade-offs）
/// - `port` 以引用传入，由需要延迟完成的实现自行克隆保存；同步完成的实现无需任何分配。
pub trait AsyncLink: Send + Sync + 'static {
    fn submit_read(&self, packet: Packet, port: &Arc<dyn CompletionPort>) -> Submission;

    fn submit_write(&self, packet: Packet, port: &Arc<dyn CompletionPort>) -> Submission;

    /// 是否支持零字节探测读。
    fn supports_zero_byte_probe(&self) -> bool {
        false
    }

    fn teardown(&self, mode: TeardownMode);

    /// 用于日志的链路描述。
    fn describe(&self) -> Cow<'_, str>;
}
