//! 写流水线。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 发送请求可能来自任意线程，写完成也可能乱序到达；字节离开连接的顺序必须与调用顺序一致，
//!   同时在途字节不得超过配置的出站上限。
//!
//! ## 逻辑（How）
//! - `enqueue` 在 `writes` 锁内分配序号并入队，随后投递一个 `WriteRequest` 控制事件驱动排空；
//! - 同一时刻只有一个排空者（[`DrainGate`](crate::connection::DrainGate)）；其余调用方只置“重跑”标记，
//!   由当前排空者在退出前再跑一轮；
//! - 排空按序号取项，分块受 `min(上限 - 在途字节, 大档容量)` 约束；
//!   链路暂不可写、预算用尽或写后信号需等待时，该项放回单槽 `requeued` 并停止本轮；
//! - 写后信号只在在途字节为零时触发，以保证它排在此前全部写之后；
//! - 流式数据源按预算拉取分块，未能提交的分块挂回该项自己的分块队列。
//!
//! ## 契约（What）
//! - `outgoing_bytes` 只统计已提交给链路的写字节；`outgoing_writes` 统计排队项与在途写 Packet，
//!   两者独立维护；
//! - 非优雅关闭或链路拆除后，排队项被整体丢弃，写后信号不再触发；
//! - 用户回调（写后信号）在任何锁之外执行。

use std::{
    collections::{BTreeMap, VecDeque},
    io::{self, Read},
    panic::{self, AssertUnwindSafe},
    sync::atomic::Ordering,
};

use bytes::{Buf, Bytes};
use spark_buffer::{LARGE_PACKET_CAPACITY, Packet, PacketKind};
use spark_transport::Submission;
use spark_transport_tls::Encrypted;
use tracing::{debug, trace, warn};

use crate::{
    connection::Connection,
    engine::EngineCore,
    error::ConduitError,
    lifecycle,
    router::Worklist,
    state::{CLOSED, GRACEFUL_SHUTDOWN, HANDSHAKE_DONE, HAS_TLS, LINK_TORN_DOWN, OUTPUT_PAUSED},
    tls::{self, Flush},
};

/// 单条 TLS 记录的最大附加开销（头部、显式 nonce、认证标签、内容类型），
/// 为密文预留后，明文分块加密后仍不超过预算与大档容量。
const TLS_RECORD_OVERHEAD: usize = 64;

pub(crate) type Signal = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum WriteItem {
    Buffer(Bytes),
    Stream {
        source: Box<dyn Read + Send + 'static>,
        pending: VecDeque<Bytes>,
    },
    Signal(Signal),
}

#[derive(Default)]
pub(crate) struct WriteState {
    next_assigned: u64,
    next_to_send: u64,
    queue: BTreeMap<u64, WriteItem>,
    requeued: Option<WriteItem>,
}

impl WriteState {
    fn take_all(&mut self) -> Vec<WriteItem> {
        let mut items: Vec<WriteItem> = self.requeued.take().into_iter().collect();
        items.extend(std::mem::take(&mut self.queue).into_values());
        self.next_to_send = self.next_assigned;
        items
    }
}

/// 入队一个发送项，返回其序号。
///
/// 关闭先置状态位、再在 `writes` 锁内丢弃队列；此处在同一把锁内复查状态，
/// 与关闭赛跑的发送要么被丢弃，要么在这里被拒绝，不会滞留在已关闭的连接上。
pub(crate) fn enqueue(conn: &Connection, item: WriteItem) -> Result<u64, ConduitError> {
    let mut writes = conn.writes.lock();
    if conn.state.load() & (CLOSED | LINK_TORN_DOWN) != 0 {
        return Err(ConduitError::Cancelled);
    }
    let sequence = writes.next_assigned;
    writes.next_assigned += 1;
    writes.queue.insert(sequence, item);
    conn.outgoing_writes.fetch_add(1, Ordering::AcqRel);
    Ok(sequence)
}

/// 丢弃全部排队项；返回丢弃数量。
pub(crate) fn discard_queue(conn: &Connection) -> usize {
    let items = conn.writes.lock().take_all();
    let count = items.len();
    if count > 0 {
        conn.outgoing_writes.fetch_sub(count, Ordering::AcqRel);
        debug!(handle = %conn.handle, items = count, "pending writes discarded");
    }
    drop(items);
    count
}

fn next_item(conn: &Connection) -> Option<WriteItem> {
    let mut writes = conn.writes.lock();
    if let Some(item) = writes.requeued.take() {
        return Some(item);
    }
    let sequence = writes.next_to_send;
    let item = writes.queue.remove(&sequence)?;
    writes.next_to_send += 1;
    Some(item)
}

fn requeue(conn: &Connection, item: WriteItem) {
    let previous = conn.writes.lock().requeued.replace(item);
    debug_assert!(previous.is_none(), "requeued slot already occupied");
}

fn writes_allowed(conn: &Connection) -> bool {
    let state = conn.state.load();
    state & LINK_TORN_DOWN == 0 && (state & CLOSED == 0 || state & GRACEFUL_SHUTDOWN != 0)
}

fn budget(core: &EngineCore, conn: &Connection, tls: bool) -> usize {
    let available = core
        .config
        .outgoing_byte_ceiling
        .saturating_sub(conn.outgoing_bytes.load(Ordering::Acquire));
    if tls {
        available
            .saturating_sub(TLS_RECORD_OVERHEAD)
            .min(LARGE_PACKET_CAPACITY - TLS_RECORD_OVERHEAD)
    } else {
        available.min(LARGE_PACKET_CAPACITY)
    }
}

/// 提交结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Submitted {
    Sent,
    Blocked,
    Failed,
}

/// 把一个写 Packet 交给链路并记账。
pub(crate) fn submit_packet(
    core: &EngineCore,
    conn: &Connection,
    mut packet: Packet,
    work: &mut Worklist,
) -> Submitted {
    if conn.state.contains(LINK_TORN_DOWN) {
        core.pool.release(packet, Some(&conn.local));
        return Submitted::Failed;
    }
    let len = packet.len();
    packet.set_kind(PacketKind::Write);
    packet.set_owner(conn.handle.get());
    let in_flight = conn.outgoing_bytes.fetch_add(len, Ordering::AcqRel) + len;
    conn.stats.observe_outgoing(in_flight);
    conn.outgoing_writes.fetch_add(1, Ordering::AcqRel);
    conn.retain_op();
    match conn.link.submit_write(packet, core.port()) {
        Submission::Pending => Submitted::Sent,
        Submission::Completed {
            packet,
            transferred,
        } => {
            work.push_back((packet, Ok(transferred)));
            Submitted::Sent
        }
        Submission::WouldBlock(packet) => {
            conn.outgoing_bytes.fetch_sub(len, Ordering::AcqRel);
            conn.outgoing_writes.fetch_sub(1, Ordering::AcqRel);
            core.pool.release(packet, Some(&conn.local));
            conn.release(core);
            trace!(handle = %conn.handle, bytes = len, "link would block; write requeued");
            Submitted::Blocked
        }
        Submission::EndOfStream(packet) => {
            work.push_back((packet, Err(io::Error::from(io::ErrorKind::WriteZero))));
            Submitted::Failed
        }
        Submission::Failed { packet, error } => {
            work.push_back((packet, Err(error)));
            Submitted::Failed
        }
    }
}

/// 路由一个写完成；返回需要记录的关闭状态。
pub(crate) fn on_write_complete(
    core: &EngineCore,
    conn: &Connection,
    packet: Packet,
    result: io::Result<usize>,
) -> Option<Result<(), ConduitError>> {
    let requested = packet.len();
    conn.outgoing_bytes.fetch_sub(requested, Ordering::AcqRel);
    core.pool.release(packet, Some(&conn.local));
    let status = match result {
        Ok(written) if written >= requested => {
            conn.stats.record_write(written);
            trace!(handle = %conn.handle, bytes = written, "write completed");
            None
        }
        Ok(written) => {
            warn!(handle = %conn.handle, requested, written, "short write");
            Some(Err(ConduitError::WriteFault { requested, written }))
        }
        Err(err) => {
            debug!(handle = %conn.handle, error = %err, "write failed");
            Some(Err(err.into()))
        }
    };
    conn.outgoing_writes.fetch_sub(1, Ordering::AcqRel);
    status
}

/// 排空出站队列；并发调用者合并为同一个排空者。
pub(crate) fn drain_outgoing(core: &EngineCore, conn: &Connection, work: &mut Worklist) {
    let gate = &conn.drain;
    gate.rerun.store(true, Ordering::Release);
    loop {
        if gate
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        while gate.rerun.swap(false, Ordering::AcqRel) {
            drain_once(core, conn, work);
        }
        gate.active.store(false, Ordering::Release);
        if !gate.rerun.load(Ordering::Acquire) {
            return;
        }
    }
}

enum Step {
    Done,
    Stalled(WriteItem),
    Failed(Option<ConduitError>),
}

fn drain_once(core: &EngineCore, conn: &Connection, work: &mut Worklist) {
    if !writes_allowed(conn) {
        discard_queue(conn);
        return;
    }
    let tls = conn.state.contains(HAS_TLS);
    if tls {
        let mut guard = conn.tls.lock();
        let Some(session) = guard.as_mut() else {
            discard_queue(conn);
            return;
        };
        if tls::flush_ciphertext(core, conn, session, work) != Flush::Drained {
            if !writes_allowed(conn) {
                discard_queue(conn);
            }
            return;
        }
        if !conn.state.contains(HANDSHAKE_DONE) {
            // 握手未完成就关闭的连接，排队的明文再也无法发出。
            if conn.state.contains(CLOSED) {
                discard_queue(conn);
            }
            return;
        }
    }
    loop {
        if !writes_allowed(conn) {
            discard_queue(conn);
            return;
        }
        if conn.state.contains(OUTPUT_PAUSED) {
            return;
        }
        let Some(item) = next_item(conn) else {
            return;
        };
        match step(core, conn, item, tls, work) {
            Step::Done => {
                conn.outgoing_writes.fetch_sub(1, Ordering::AcqRel);
            }
            Step::Stalled(item) => {
                requeue(conn, item);
                if !writes_allowed(conn) {
                    discard_queue(conn);
                }
                return;
            }
            Step::Failed(error) => {
                conn.outgoing_writes.fetch_sub(1, Ordering::AcqRel);
                if let Some(error) = error {
                    lifecycle::close(core, conn, Err(error));
                }
                if !writes_allowed(conn) {
                    discard_queue(conn);
                }
                return;
            }
        }
    }
}

fn step(
    core: &EngineCore,
    conn: &Connection,
    item: WriteItem,
    tls: bool,
    work: &mut Worklist,
) -> Step {
    match item {
        WriteItem::Signal(signal) => {
            if conn.outgoing_bytes.load(Ordering::Acquire) > 0 {
                return Step::Stalled(WriteItem::Signal(signal));
            }
            if panic::catch_unwind(AssertUnwindSafe(signal)).is_err() {
                warn!(handle = %conn.handle, "after-write signal panicked");
            }
            Step::Done
        }
        WriteItem::Buffer(mut data) => match push_bytes(core, conn, &mut data, tls, work) {
            Push::Exhausted => Step::Done,
            Push::Stalled => Step::Stalled(WriteItem::Buffer(data)),
            Push::Failed(error) => Step::Failed(error),
        },
        WriteItem::Stream {
            mut source,
            mut pending,
        } => loop {
            let limit = budget(core, conn, tls);
            let mut chunk = match pending.pop_front() {
                Some(chunk) => chunk,
                None if limit == 0 => return Step::Stalled(WriteItem::Stream { source, pending }),
                None => match pull_chunk(source.as_mut(), limit) {
                    Ok(chunk) => chunk,
                    Err(ConduitError::EndOfStream) => return Step::Done,
                    Err(error) => return Step::Failed(Some(error)),
                },
            };
            match push_bytes(core, conn, &mut chunk, tls, work) {
                Push::Exhausted => {}
                Push::Stalled => {
                    pending.push_front(chunk);
                    return Step::Stalled(WriteItem::Stream { source, pending });
                }
                Push::Failed(error) => return Step::Failed(error),
            }
        },
    }
}

/// 从流式数据源拉取至多 `limit` 字节；数据源耗尽时返回 `EndOfStream`。
fn pull_chunk(source: &mut (dyn Read + Send), limit: usize) -> Result<Bytes, ConduitError> {
    let mut buffer = vec![0u8; limit];
    loop {
        match source.read(&mut buffer) {
            Ok(0) => return Err(ConduitError::EndOfStream),
            Ok(read) => {
                buffer.truncate(read);
                return Ok(Bytes::from(buffer));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(ConduitError::Io {
                    kind: err.kind(),
                    message: err.to_string(),
                });
            }
        }
    }
}

enum Push {
    Exhausted,
    Stalled,
    Failed(Option<ConduitError>),
}

/// 在预算内尽可能提交 `data` 的前缀，已提交部分从 `data` 中移除。
fn push_bytes(
    core: &EngineCore,
    conn: &Connection,
    data: &mut Bytes,
    tls: bool,
    work: &mut Worklist,
) -> Push {
    while !data.is_empty() {
        let limit = budget(core, conn, tls);
        if limit == 0 {
            return Push::Stalled;
        }
        let count = data.len().min(limit);
        if tls {
            let mut guard = conn.tls.lock();
            let Some(session) = guard.as_mut() else {
                return Push::Failed(None);
            };
            match session.encrypt(&data[..count]) {
                Ok(Encrypted::Accepted(accepted)) => data.advance(accepted),
                Ok(Encrypted::TryLater) => return Push::Stalled,
                Err(err) => {
                    warn!(handle = %conn.handle, error = %err, "TLS encryption failed");
                    return Push::Failed(Some(err.into()));
                }
            }
            match tls::flush_ciphertext(core, conn, session, work) {
                Flush::Drained => {}
                Flush::Blocked => return Push::Stalled,
                Flush::Failed => return Push::Failed(None),
            }
        } else {
            let mut packet = core
                .pool
                .acquire(PacketKind::Write, count, Some(&conn.local));
            packet.fill_from(&data[..count]);
            match submit_packet(core, conn, packet, work) {
                Submitted::Sent => data.advance(count),
                Submitted::Blocked => return Push::Stalled,
                Submitted::Failed => return Push::Failed(None),
            }
        }
    }
    Push::Exhausted
}
