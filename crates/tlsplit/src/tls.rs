use std::net::IpAddr;
use std::sync::Arc;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
    aws_lc_rs as provider, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
    WebPkiSupportedAlgorithms,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, Error, SignatureScheme};
use tokio_rustls::TlsConnector;

/// Build the connector used to upgrade destination connections.
/// Server certificates are not verified.
pub fn build_destination_connector() -> Result<TlsConnector, Error> {
    let provider = Arc::new(CryptoProvider {
        cipher_suites: provider::DEFAULT_CIPHER_SUITES.to_vec(),
        ..provider::default_provider()
    });

    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(tokio_rustls::rustls::DEFAULT_VERSIONS)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(&provider)))
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// The name to present in SNI: the recipient's domain when it is known,
/// otherwise the destination address.
pub fn server_name_for(
    recipient_domain: Option<&str>,
    destination: IpAddr,
) -> ServerName<'static> {
    recipient_domain
        .and_then(|domain| ServerName::try_from(domain.to_string()).ok())
        .unwrap_or_else(|| ServerName::IpAddress(destination.into()))
}

/// Accepts whatever certificate the destination presents.
/// Handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        tracing::trace!(
            "accepting unverified certificate for {server_name:?} \
             ({} bytes, {} intermediates)",
            end_entity.len(),
            intermediates.len()
        );
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
