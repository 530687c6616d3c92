use std::{fmt, num::NonZeroU64};

/// 连接的不透明句柄。
///
/// 句柄是单调递增的计数值，从不暴露内存地址；连接销毁后同一数值不会被复用，
/// 因此过期句柄上的调用只会得到“无效句柄”错误，而不会命中新连接。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(NonZeroU64);

impl ConnectionHandle {
    pub(crate) fn new(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    /// 从原始数值恢复句柄；0 不是合法句柄。
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// 连接类别。
///
/// `Listener` 只承载接入事件与回调，不发起读预取。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionClass {
    Client,
    Server,
    Listener,
}
