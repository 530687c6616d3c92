use std::collections::VecDeque;

/// 连接的接收环形缓冲。
///
/// 读流水线按序追加明文，用户通过 peek / consume 非阻塞地取用；
/// 容量随数据增长，背压由暂停输入控制而非缓冲上限。
#[derive(Debug, Default)]
pub(crate) struct ReceiveBuffer {
    bytes: VecDeque<u8>,
}

impl ReceiveBuffer {
    pub(crate) fn append(&mut self, data: &[u8]) {
        self.bytes.extend(data);
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes.len()
    }

    /// 复制至多 `out.len()` 字节到 `out`，不消费；返回复制数量。
    pub(crate) fn peek(&self, out: &mut [u8]) -> usize {
        let (front, back) = self.bytes.as_slices();
        let first = front.len().min(out.len());
        out[..first].copy_from_slice(&front[..first]);
        let second = back.len().min(out.len() - first);
        out[first..first + second].copy_from_slice(&back[..second]);
        first + second
    }

    /// 丢弃至多 `count` 字节；返回实际丢弃数量。
    pub(crate) fn consume(&mut self, count: usize) -> usize {
        let count = count.min(self.bytes.len());
        self.bytes.drain(..count);
        count
    }
}
