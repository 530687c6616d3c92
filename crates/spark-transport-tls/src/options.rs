/// 会话角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// 建立 TLS 会话所需的全部输入。
///
/// # 契约说明（What）
/// - 证书与私钥均以 DER 字节给出，调用方无需依赖 rustls 类型；
/// - `hostname`：客户端用于 SNI 与证书名称校验；开启校验时必填，关闭校验时缺省为 `localhost`；
/// - `trusted_certs`：客户端信任的根证书集合，可以为空；
/// - `local_cert_chain` + `private_key`：服务端必填；客户端同时提供时作为客户端证书；
/// - `dh_params`：仅为接口兼容保留；
/// - `verify_certificates`：是否在握手完成后执行证书链校验（仅客户端生效）；
/// - `accept_self_signed`：校验开启时是否接受自签名的终端证书；
/// - `alpn`：按优先级排列的 ALPN 协议标识。
#[derive(Clone, Debug)]
pub struct TlsOptions {
    pub hostname: Option<String>,
    pub trusted_certs: Vec<Vec<u8>>,
    pub local_cert_chain: Vec<Vec<u8>>,
    pub private_key: Option<Vec<u8>>,
    pub dh_params: Option<Vec<u8>>,
    pub verify_certificates: bool,
    pub accept_self_signed: bool,
    pub alpn: Vec<Vec<u8>>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            hostname: None,
            trusted_certs: Vec::new(),
            local_cert_chain: Vec::new(),
            private_key: None,
            dh_params: None,
            verify_certificates: true,
            accept_self_signed: false,
            alpn: Vec::new(),
        }
    }
}

impl TlsOptions {
    /// 客户端选项：以 `hostname` 作为 SNI 与名称校验目标。
    pub fn client(hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ..Self::default()
        }
    }

    /// 服务端选项：证书链（叶证书在前）与 PKCS#8 / SEC1 / PKCS#1 私钥。
    pub fn server(cert_chain: Vec<Vec<u8>>, private_key: Vec<u8>) -> Self {
        Self {
            local_cert_chain: cert_chain,
            private_key: Some(private_key),
            ..Self::default()
        }
    }

    pub fn with_trusted_cert(mut self, der: Vec<u8>) -> Self {
        self.trusted_certs.push(der);
        self
    }

    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verify_certificates = enabled;
        self
    }

    pub fn accept_self_signed(mut self, accept: bool) -> Self {
        self.accept_self_signed = accept;
        self
    }

    pub fn with_dh_params(mut self, params: Vec<u8>) -> Self {
        self.dh_params = Some(params);
        self
    }

    pub fn with_alpn(mut self, protocol: impl Into<Vec<u8>>) -> Self {
        self.alpn.push(protocol.into());
        self
    }
}
