use core::fmt;

use bytes::BytesMut;

/// 小档 Packet 的固定容量，覆盖控制事件、零字节探测与写请求。
pub const SMALL_PACKET_CAPACITY: usize = 512;

/// 大档 Packet 的固定容量，用于真实的读写数据，恰好容纳一条完整的 TLS 记录明文。
pub const LARGE_PACKET_CAPACITY: usize = 16 * 1024;

/// Packet 在引擎中承担的角色。
///
/// # 契约说明（What）
/// - `Read`：携带序号的真实读操作，完成后按序号交付；
/// - `ZeroByteProbe`：零长度读，只用于探测“是否有数据可读”，不占用数据缓冲；
/// - `Write`：已经提交给链路的一段出站字节；
/// - `WriteRequest`：`send` 之后投递给调度池的“请处理出站队列”事件；
/// - `ResumeProcessing`：恢复输入后补齐预读窗口并重放排空逻辑；
/// - `InitialSetup`：连接注册后的首个事件，触发 Connect 回调与预读；
/// - `Discard`：不携带语义的占位事件，只用于驱动完成后的收尾检查（例如关闭后的关停流程）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Read,
    ZeroByteProbe,
    Write,
    WriteRequest,
    ResumeProcessing,
    InitialSetup,
    Discard,
}

impl PacketKind {
    /// 是否为纯控制事件（不经过链路）。
    pub const fn is_control(self) -> bool {
        matches!(
            self,
            PacketKind::WriteRequest
                | PacketKind::ResumeProcessing
                | PacketKind::InitialSetup
                | PacketKind::Discard
        )
    }
}

/// 两档尺寸分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    /// 根据期望容量选择档位；超过大档容量的请求仍落在大档，由调用方自行分片。
    pub const fn for_request(desired: usize) -> Self {
        if desired <= SMALL_PACKET_CAPACITY {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }

    /// 档位对应的固定容量。
    pub const fn capacity(self) -> usize {
        match self {
            SizeClass::Small => SMALL_PACKET_CAPACITY,
            SizeClass::Large => LARGE_PACKET_CAPACITY,
        }
    }
}

/// 池化 I/O 缓冲：定长存储加上随操作流转的元数据。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 异步操作在提交与完成之间可能跨越不同线程，Packet 以“值”的形式在
///   流水线、链路与池之间转移所有权，任何时刻只有一个持有者；
/// - 元数据（种类、序号、归属连接）随缓冲一起流转，完成路由无需额外的旁路表即可定位上下文。
///
/// ## 逻辑（How）
/// - 存储在创建时按档位一次性清零分配，之后只移动 `len` 游标，复用时无需重新初始化；
/// - `owner` 只是连接句柄的数值，不持有连接的引用计数，连接的存活由引擎的租约体系保障。
///
/// ## 契约（What）
/// - `spare_mut` 暴露整个定长存储，链路将数据写入后调用 [`Packet::set_len`]；
/// - `filled` 返回 `[0, len)` 的有效字节；
/// - Packet 永不跨连接共享，归还池时元数据会被重置。
pub struct Packet {
    kind: PacketKind,
    class: SizeClass,
    storage: BytesMut,
    len: usize,
    sequence: u64,
    owner: u64,
}

impl Packet {
    /// 直接分配一个新的 Packet；常规路径应通过 [`crate::PacketPool::acquire`] 获取。
    pub fn new(kind: PacketKind, class: SizeClass) -> Self {
        Self {
            kind,
            class,
            storage: BytesMut::zeroed(class.capacity()),
            len: 0,
            sequence: 0,
            owner: 0,
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// 复用同一块缓冲承担新的角色，例如把探测包降级为丢弃事件。
    pub fn set_kind(&mut self, kind: PacketKind) {
        self.kind = kind;
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// 已使用的字节数。
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 是否为零字节探测包；链路据此决定“等到可读再完成、且不消费数据”。
    pub fn is_probe(&self) -> bool {
        self.kind == PacketKind::ZeroByteProbe
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// 归属连接的句柄数值（非拥有引用）。
    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn set_owner(&mut self, owner: u64) {
        self.owner = owner;
    }

    /// 整个定长存储的可写视图，供链路直接填充读取结果。
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[..]
    }

    /// 记录有效字节数；超过容量的值会被截断到容量。
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity(), "packet length exceeds capacity");
        self.len = len.min(self.capacity());
    }

    /// 有效字节视图。
    pub fn filled(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// 从切片复制尽可能多的字节，返回实际复制的数量。
    pub fn fill_from(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.capacity());
        self.storage[..count].copy_from_slice(&data[..count]);
        self.len = count;
        count
    }

    /// 清空元数据以便复用；存储内容保持原样，由 `len` 游标屏蔽旧数据。
    pub(crate) fn reset(&mut self, kind: PacketKind) {
        self.kind = kind;
        self.len = 0;
        self.sequence = 0;
        self.owner = 0;
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("class", &self.class)
            .field("len", &self.len)
            .field("sequence", &self.sequence)
            .field("owner", &self.owner)
            .finish()
    }
}
