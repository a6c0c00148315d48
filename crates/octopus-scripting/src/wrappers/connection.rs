//! Connection and TLS wrappers

use super::{Method, Reply, Wrapper, WrapperContext};
use crate::error::Result;
use crate::value::Args;
use octopus_core::SslConnectionInfo;

/// Downstream connection
#[derive(Debug)]
pub(crate) struct ConnectionWrapper;

impl ConnectionWrapper {
    pub(crate) const METHODS: &'static [(&'static str, Method<Self>)] = &[("ssl", Self::ssl)];

    fn ssl(&mut self, ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        let ssl = ctx.callbacks.connection().and_then(|c| c.ssl.clone());
        Ok(Reply::object_or_nil(
            ssl.map(|info| Wrapper::SslConnection(SslConnectionWrapper::new(info))),
        ))
    }
}

/// TLS details; a snapshot taken when the wrapper was created
#[derive(Debug)]
pub(crate) struct SslConnectionWrapper {
    info: SslConnectionInfo,
}

impl SslConnectionWrapper {
    pub(crate) const METHODS: &'static [(&'static str, Method<Self>)] = &[
        ("peerCertificatePresented", Self::peer_certificate_presented),
        ("peerCertificateValidated", Self::peer_certificate_validated),
        ("sha256PeerCertificateDigest", Self::sha256_peer_certificate_digest),
        ("subjectPeerCertificate", Self::subject_peer_certificate),
        ("serialNumberPeerCertificate", Self::serial_number_peer_certificate),
        ("tlsVersion", Self::tls_version),
        ("ciphersuiteString", Self::ciphersuite_string),
    ];

    pub(crate) fn new(info: SslConnectionInfo) -> Self {
        Self { info }
    }

    fn peer_certificate_presented(&mut self, _ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::value(self.info.peer_certificate_presented))
    }

    fn peer_certificate_validated(&mut self, _ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::value(self.info.peer_certificate_validated))
    }

    fn sha256_peer_certificate_digest(
        &mut self,
        _ctx: &mut WrapperContext<'_>,
        _args: &Args,
    ) -> Result<Reply> {
        Ok(Reply::value(self.info.sha256_peer_certificate_digest.as_str()))
    }

    fn subject_peer_certificate(&mut self, _ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::value(self.info.subject_peer_certificate.as_str()))
    }

    fn serial_number_peer_certificate(
        &mut self,
        _ctx: &mut WrapperContext<'_>,
        _args: &Args,
    ) -> Result<Reply> {
        Ok(Reply::value(self.info.serial_number_peer_certificate.as_str()))
    }

    fn tls_version(&mut self, _ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::value(self.info.tls_version.as_str()))
    }

    fn ciphersuite_string(&mut self, _ctx: &mut WrapperContext<'_>, _args: &Args) -> Result<Reply> {
        Ok(Reply::value(self.info.ciphersuite.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingCallbacks;
    use crate::value::Value;
    use octopus_core::Connection;

    #[test]
    fn test_ssl_absent_on_plaintext_connection() {
        let mut cb = RecordingCallbacks::default();
        cb.connection = Some(Connection::default());
        let mut chunk = None;
        let mut ctx = WrapperContext {
            callbacks: &mut cb,
            headers_continued: false,
            current_chunk: &mut chunk,
        };

        match ConnectionWrapper.ssl(&mut ctx, &Args::default()).unwrap() {
            Reply::Values(values) => assert!(values[0].is_nil()),
            Reply::Object(_) => panic!("expected nil"),
        }
    }

    #[test]
    fn test_ssl_fields() {
        let mut cb = RecordingCallbacks::default();
        let mut chunk = None;
        let mut ctx = WrapperContext {
            callbacks: &mut cb,
            headers_continued: false,
            current_chunk: &mut chunk,
        };
        let mut wrapper = SslConnectionWrapper::new(SslConnectionInfo {
            peer_certificate_presented: true,
            tls_version: "TLSv1.3".to_string(),
            ..Default::default()
        });

        for (method, expected) in [
            ("peerCertificatePresented", Value::Bool(true)),
            ("peerCertificateValidated", Value::Bool(false)),
            ("tlsVersion", Value::from("TLSv1.3")),
        ] {
            let f = super::super::lookup(SslConnectionWrapper::METHODS, method).unwrap();
            match f(&mut wrapper, &mut ctx, &Args::default()).unwrap() {
                Reply::Values(values) => assert_eq!(values[0], expected),
                Reply::Object(_) => panic!("unexpected object"),
            }
        }
    }
}
