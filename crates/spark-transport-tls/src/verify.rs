use std::sync::Arc;

use rustls::{
    CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{
        CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
    },
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

use crate::error::TrustFailure;

/// 握手期间使用的校验器：只验证握手签名，证书链推迟到握手完成后由 [`VerifyPolicy`] 检查。
///
/// # 意图（Why）
/// - 记录层在握手结束时才执行信任策略，这样每一种失败都能以独立的 [`TrustFailure`] 报告，
///   并且“接受自签名”的开关不需要侵入 rustls 的握手状态机；
/// - 签名仍然在握手中校验，保证对端确实持有证书私钥。
#[derive(Debug)]
pub(crate) struct DeferredServerVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl DeferredServerVerifier {
    pub(crate) fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for DeferredServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// 握手完成后的证书信任策略。
///
/// # 逻辑（How）
/// 1. 对端证书链为空视为链错误；
/// 2. 存在信任根时，用 webpki 校验整条链与主机名；
/// 3. 签发者不受信任时，再以叶证书自身作为唯一信任根重试：
///    通过则说明是自签名证书，按策略接受或报告 `SelfSigned`；
///    仍报告签发者未知则说明确实是未知 CA 签发，报告 `UntrustedIssuer`。
#[derive(Debug)]
pub(crate) struct VerifyPolicy {
    provider: Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
    server_name: ServerName<'static>,
    accept_self_signed: bool,
}

impl VerifyPolicy {
    pub(crate) fn new(
        provider: Arc<CryptoProvider>,
        roots: RootCertStore,
        server_name: ServerName<'static>,
        accept_self_signed: bool,
    ) -> Self {
        Self {
            provider,
            roots: Arc::new(roots),
            server_name,
            accept_self_signed,
        }
    }

    pub(crate) fn check(&self, chain: &[CertificateDer<'_>]) -> Result<(), TrustFailure> {
        let Some((end_entity, intermediates)) = chain.split_first() else {
            return Err(TrustFailure::Chain);
        };
        let now = UnixTime::now();
        let verdict = if self.roots.is_empty() {
            Err(TrustFailure::UntrustedIssuer)
        } else {
            self.verify_against(Arc::clone(&self.roots), end_entity, intermediates, now)
        };
        match verdict {
            Err(TrustFailure::UntrustedIssuer) => self.check_self_signed(end_entity, now),
            other => other,
        }
    }

    fn check_self_signed(
        &self,
        end_entity: &CertificateDer<'_>,
        now: UnixTime,
    ) -> Result<(), TrustFailure> {
        let mut own = RootCertStore::empty();
        if own.add(end_entity.clone().into_owned()).is_err() {
            return Err(TrustFailure::UntrustedIssuer);
        }
        match self.verify_against(Arc::new(own), end_entity, &[], now) {
            Ok(()) if self.accept_self_signed => Ok(()),
            Ok(()) => Err(TrustFailure::SelfSigned),
            Err(failure) => Err(failure),
        }
    }

    fn verify_against(
        &self,
        roots: Arc<RootCertStore>,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), TrustFailure> {
        let verifier =
            WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(&self.provider))
                .build()
                .map_err(|_| TrustFailure::Chain)?;
        verifier
            .verify_server_cert(end_entity, intermediates, &self.server_name, &[], now)
            .map(|_| ())
            .map_err(|err| classify(&err))
    }
}

/// 将 rustls 的证书错误映射为信任失败类别。
pub(crate) fn classify(error: &rustls::Error) -> TrustFailure {
    match error {
        rustls::Error::InvalidCertificate(cert) => match cert {
            CertificateError::Expired
            | CertificateError::ExpiredContext { .. }
            | CertificateError::NotValidYet
            | CertificateError::NotValidYetContext { .. } => TrustFailure::Expired,
            CertificateError::Revoked => TrustFailure::Revoked,
            CertificateError::UnknownIssuer => TrustFailure::UntrustedIssuer,
            _ => TrustFailure::Chain,
        },
        _ => TrustFailure::Chain,
    }
}
