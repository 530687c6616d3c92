#![doc = r#"
# spark-transport-tls

## 设计动机（Why）
- **解耦记录层与异步 I/O**：完成端口引擎的读写由外部调度池驱动，TLS 库却期望一个可同步读写的传输；
  本 crate 让 TLS 会话面对两条内存字节队列（入站密文、出站密文），而不是真实套接字；
- **可判定的信任错误**：证书校验推迟到握手完成之后执行，每一种校验失败映射为一个独立的 [`TrustFailure`]，
  并提供“接受自签名证书”的显式策略开关。

## 核心契约（What）
- [`TlsSession`]：客户端或服务端会话；`absorb` 写入密文、`advance` 推进一轮记录处理、
  `encrypt` 提交明文、`take_ciphertext` 取出待发送密文；
- [`TlsOptions`]：主机名、信任证书、本地证书链与私钥、DH 参数、校验与自签名策略；
- [`TlsError`]：配置错误、协议错误、信任错误的统一枚举。

## 实现策略（How）
- 基于 `rustls`，`VecDeque<u8>` 同时实现 `io::Read` / `io::Write`，直接作为 `read_tls` / `write_tls` 的端点；
- 客户端握手期间只校验签名，握手完成后用 webpki 对对端证书链执行策略检查。

## 风险与考量（Trade-offs）
- 会话对象不可重入，调用方需自行以锁保护；
- rustls 只协商 ECDHE，`dh_params` 仅为接口兼容保留，不参与协商。
"#]

mod error;
mod options;
mod session;
mod verify;

pub use error::{TlsError, TrustFailure};
pub use options::{TlsOptions, TlsRole};
pub use session::{Encrypted, Progress, TlsSession};
