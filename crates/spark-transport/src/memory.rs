use std::{
    borrow::Cow,
    collections::VecDeque,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use spark_buffer::Packet;
use tracing::trace;

use crate::link::{AsyncLink, CompletionPort, Submission, TeardownMode};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内双工链路：一端写入的字节出现在另一端的入站队列中。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为引擎测试与进程内回环提供一个真正“异步完成”的链路：读在无数据时挂起，
///   直到对端写入或拆除后经由 [`CompletionPort`] 回送；
/// - 语义对齐套接字：优雅拆除让对端读到流结束，强制拆除让对端读到连接重置。
///
/// ## 逻辑（How）
/// - 每端一个 `Endpoint`，保存该端的入站字节与挂起读；
/// - 写操作只锁对端 `Endpoint`，追加字节后按挂起顺序满足读与零字节探测，
///   回送动作在释放锁之后执行；
/// - 写总是同步完成（`Submission::Completed`），读在有数据时同步完成，否则挂起。
///
/// ## 契约（What）
/// - `pair()` 返回互为对端的两条链路；
/// - `teardown` 以 `ConnectionAborted` 完成本端全部挂起读，并向对端传播 EOF 或重置；
/// - 对端拆除后的写以 `BrokenPipe` 失败。
pub struct MemoryLink {
    id: u64,
    local: Arc<Endpoint>,
    peer: Arc<Endpoint>,
}

#[derive(Default)]
struct Endpoint {
    state: Mutex<EndpointState>,
}

#[derive(Default)]
struct EndpointState {
    inbound: VecDeque<u8>,
    pending: VecDeque<(Packet, Arc<dyn CompletionPort>)>,
    torn_down: bool,
    peer_eof: bool,
    peer_reset: bool,
}

type Ready = Vec<(Packet, Arc<dyn CompletionPort>, io::Result<usize>)>;

impl MemoryLink {
    /// 创建一对互为对端的链路。
    pub fn pair() -> (MemoryLink, MemoryLink) {
        let left = Arc::new(Endpoint::default());
        let right = Arc::new(Endpoint::default());
        let a = MemoryLink {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            local: Arc::clone(&left),
            peer: Arc::clone(&right),
        };
        let b = MemoryLink {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            local: right,
            peer: left,
        };
        (a, b)
    }

    /// 本端尚未被读取的入站字节数。
    pub fn buffered(&self) -> usize {
        self.local.state.lock().inbound.len()
    }

    /// 本端挂起的读操作数（含探测）。
    pub fn pending_reads(&self) -> usize {
        self.local.state.lock().pending.len()
    }
}

impl EndpointState {
    /// 尽可能满足挂起读，返回待回送的完成。
    fn satisfy_pending(&mut self) -> Ready {
        let mut ready = Vec::new();
        while let Some((front, _)) = self.pending.front() {
            let probe = front.is_probe();
            let terminal = if !self.inbound.is_empty() {
                None
            } else if self.peer_reset {
                Some(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
            } else if self.peer_eof {
                Some(Ok(0))
            } else {
                break;
            };
            let Some((mut packet, port)) = self.pending.pop_front() else {
                break;
            };
            match terminal {
                Some(result) => ready.push((packet, port, result)),
                None if probe => ready.push((packet, port, Ok(0))),
                None => {
                    let count = fill(&mut self.inbound, &mut packet);
                    ready.push((packet, port, Ok(count)));
                }
            }
        }
        ready
    }
}

fn fill(inbound: &mut VecDeque<u8>, packet: &mut Packet) -> usize {
    let count = inbound.len().min(packet.capacity());
    let spare = packet.spare_mut();
    for (slot, byte) in spare.iter_mut().zip(inbound.drain(..count)) {
        *slot = byte;
    }
    packet.set_len(count);
    count
}

fn deliver(ready: Ready) {
    for (packet, port, result) in ready {
        port.complete(packet, result);
    }
}

impl AsyncLink for MemoryLink {
    fn submit_read(&self, mut packet: Packet, port: &Arc<dyn CompletionPort>) -> Submission {
        let mut state = self.local.state.lock();
        if state.torn_down {
            return Submission::Failed {
                packet,
                error: io::Error::from(io::ErrorKind::ConnectionAborted),
            };
        }
        if !state.inbound.is_empty() && state.pending.is_empty() {
            if packet.is_probe() {
                return Submission::Completed {
                    packet,
                    transferred: 0,
                };
            }
            let transferred = fill(&mut state.inbound, &mut packet);
            return Submission::Completed {
                packet,
                transferred,
            };
        }
        if state.pending.is_empty() && state.inbound.is_empty() {
            if state.peer_reset {
                return Submission::Failed {
                    packet,
                    error: io::Error::from(io::ErrorKind::ConnectionReset),
                };
            }
            if state.peer_eof {
                return Submission::EndOfStream(packet);
            }
        }
        state.pending.push_back((packet, Arc::clone(port)));
        Submission::Pending
    }

    fn submit_write(&self, packet: Packet, _port: &Arc<dyn CompletionPort>) -> Submission {
        if self.local.state.lock().torn_down {
            return Submission::Failed {
                packet,
                error: io::Error::from(io::ErrorKind::BrokenPipe),
            };
        }
        let ready = {
            let mut peer = self.peer.state.lock();
            if peer.torn_down || peer.peer_eof || peer.peer_reset {
                return Submission::Failed {
                    packet,
                    error: io::Error::from(io::ErrorKind::BrokenPipe),
                };
            }
            peer.inbound.extend(packet.filled());
            peer.satisfy_pending()
        };
        deliver(ready);
        let transferred = packet.len();
        Submission::Completed {
            packet,
            transferred,
        }
    }

    fn supports_zero_byte_probe(&self) -> bool {
        true
    }

    fn teardown(&self, mode: TeardownMode) {
        let cancelled: Ready = {
            let mut state = self.local.state.lock();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            state
                .pending
                .drain(..)
                .map(|(packet, port)| {
                    (
                        packet,
                        port,
                        Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
                    )
                })
                .collect()
        };
        deliver(cancelled);
        let ready = {
            let mut peer = self.peer.state.lock();
            match mode {
                TeardownMode::Graceful => peer.peer_eof = true,
                TeardownMode::Abortive => {
                    peer.peer_reset = true;
                    peer.inbound.clear();
                }
            }
            peer.satisfy_pending()
        };
        trace!(link = self.id, ?mode, "memory link torn down");
        deliver(ready);
    }

    fn describe(&self) -> Cow<'_, str> {
        Cow::Owned(format!("memory:{}", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_buffer::{PacketKind, SizeClass};
    use std::sync::mpsc;

    struct ChannelPort(Mutex<mpsc::Sender<(Packet, io::Result<usize>)>>);

    impl CompletionPort for ChannelPort {
        fn complete(&self, packet: Packet, result: io::Result<usize>) {
            let _ = self.0.lock().send((packet, result));
        }
    }

    fn port() -> (Arc<dyn CompletionPort>, mpsc::Receiver<(Packet, io::Result<usize>)>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelPort(Mutex::new(tx))), rx)
    }

    fn write(link: &MemoryLink, port: &Arc<dyn CompletionPort>, data: &[u8]) {
        let mut packet = Packet::new(PacketKind::Write, SizeClass::Large);
        packet.fill_from(data);
        assert!(matches!(
            link.submit_write(packet, port),
            Submission::Completed { transferred, .. } if transferred == data.len()
        ));
    }

    #[test]
    fn pending_read_completes_when_peer_writes() {
        let (a, b) = MemoryLink::pair();
        let (port, rx) = port();
        let read = Packet::new(PacketKind::Read, SizeClass::Large);
        assert!(matches!(b.submit_read(read, &port), Submission::Pending));
        write(&a, &port, b"hello");
        let (packet, result) = rx.try_recv().expect("对端写入后应回送读完成");
        assert_eq!(result.expect("读应成功"), 5);
        assert_eq!(packet.filled(), b"hello");
    }

    #[test]
    fn probe_does_not_consume_data() {
        let (a, b) = MemoryLink::pair();
        let (port, rx) = port();
        let probe = Packet::new(PacketKind::ZeroByteProbe, SizeClass::Small);
        assert!(matches!(b.submit_read(probe, &port), Submission::Pending));
        write(&a, &port, b"xy");
        let (_, result) = rx.try_recv().expect("探测应完成");
        assert_eq!(result.expect("探测应成功"), 0);
        assert_eq!(b.buffered(), 2);
    }

    #[test]
    fn graceful_teardown_yields_eof_after_data() {
        let (a, b) = MemoryLink::pair();
        let (port, rx) = port();
        write(&a, &port, b"tail");
        a.teardown(TeardownMode::Graceful);
        let first = Packet::new(PacketKind::Read, SizeClass::Large);
        assert!(matches!(
            b.submit_read(first, &port),
            Submission::Completed { transferred: 4, .. }
        ));
        let second = Packet::new(PacketKind::Read, SizeClass::Large);
        assert!(matches!(
            b.submit_read(second, &port),
            Submission::EndOfStream(_)
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn teardown_cancels_local_reads_and_resets_peer() {
        let (a, b) = MemoryLink::pair();
        let (port, rx) = port();
        let local = Packet::new(PacketKind::Read, SizeClass::Large);
        let remote = Packet::new(PacketKind::Read, SizeClass::Large);
        assert!(matches!(a.submit_read(local, &port), Submission::Pending));
        assert!(matches!(b.submit_read(remote, &port), Submission::Pending));
        a.teardown(TeardownMode::Abortive);
        let kinds: Vec<io::ErrorKind> = (0..2)
            .map(|_| {
                rx.try_recv()
                    .expect("拆除应完成全部挂起读")
                    .1
                    .expect_err("挂起读应以错误完成")
                    .kind()
            })
            .collect();
        assert!(kinds.contains(&io::ErrorKind::ConnectionAborted));
        assert!(kinds.contains(&io::ErrorKind::ConnectionReset));
        let late = Packet::new(PacketKind::Write, SizeClass::Small);
        assert!(matches!(
            b.submit_write(late, &port),
            Submission::Failed { .. }
        ));
    }
}
