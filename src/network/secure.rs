//! Secure channel plumbing
//!
//! The transports never construct TLS contexts themselves; the caller builds
//! a `native_tls` connector or acceptor and hands it over behind the channel
//! traits, so certificate policy stays entirely outside this crate.

use std::io::{Read, Write};

use async_trait::async_trait;

use super::{AsyncStream, ClientError, ClientResult};

/// A bidirectional blocking byte stream, plain or TLS-wrapped.
pub trait SyncStream: Read + Write + Send {}

impl<T: Read + Write + Send> SyncStream for T {}

/// Wraps async connections in an encrypted channel.
#[async_trait]
pub trait SecureChannel: Send + Sync {
    /// Client-side wrap, authenticating the server as `domain`.
    async fn wrap_client(
        &self,
        domain: &str,
        stream: Box<dyn AsyncStream>,
    ) -> ClientResult<Box<dyn AsyncStream>>;

    /// Server-side wrap.
    async fn wrap_server(&self, stream: Box<dyn AsyncStream>) -> ClientResult<Box<dyn AsyncStream>>;
}

/// Wraps blocking connections in an encrypted channel.
pub trait BlockingSecureChannel: Send + Sync {
    fn wrap_client(
        &self,
        domain: &str,
        stream: Box<dyn SyncStream>,
    ) -> ClientResult<Box<dyn SyncStream>>;
}

/// Secure channel provider backed by `native-tls`.
///
/// Holds whichever contexts the caller supplies; using a direction that was
/// not configured is a protocol error, not a panic.
pub struct NativeTlsChannel {
    connector: Option<native_tls::TlsConnector>,
    acceptor: Option<native_tls::TlsAcceptor>,
}

impl NativeTlsChannel {
    pub fn client(connector: native_tls::TlsConnector) -> Self {
        NativeTlsChannel {
            connector: Some(connector),
            acceptor: None,
        }
    }

    pub fn server(acceptor: native_tls::TlsAcceptor) -> Self {
        NativeTlsChannel {
            connector: None,
            acceptor: Some(acceptor),
        }
    }

    fn connector(&self) -> ClientResult<&native_tls::TlsConnector> {
        self.connector.as_ref().ok_or_else(|| {
            ClientError::Protocol("secure channel has no client TLS context".to_owned())
        })
    }
}

#[async_trait]
impl SecureChannel for NativeTlsChannel {
    async fn wrap_client(
        &self,
        domain: &str,
        stream: Box<dyn AsyncStream>,
    ) -> ClientResult<Box<dyn AsyncStream>> {
        let connector = tokio_native_tls::TlsConnector::from(self.connector()?.clone());
        let tls = connector.connect(domain, stream).await?;
        Ok(Box::new(tls))
    }

    async fn wrap_server(
        &self,
        stream: Box<dyn AsyncStream>,
    ) -> ClientResult<Box<dyn AsyncStream>> {
        let acceptor = self.acceptor.as_ref().ok_or_else(|| {
            ClientError::Protocol("secure channel has no server TLS context".to_owned())
        })?;
        let acceptor = tokio_native_tls::TlsAcceptor::from(acceptor.clone());
        let tls = acceptor.accept(stream).await?;
        Ok(Box::new(tls))
    }
}

impl BlockingSecureChannel for NativeTlsChannel {
    fn wrap_client(
        &self,
        domain: &str,
        stream: Box<dyn SyncStream>,
    ) -> ClientResult<Box<dyn SyncStream>> {
        let tls = self
            .connector()?
            .connect(domain, stream)
            .map_err(|e| match e {
                native_tls::HandshakeError::Failure(e) => ClientError::Tls(e),
                native_tls::HandshakeError::WouldBlock(_) => {
                    ClientError::Protocol("TLS handshake on a non-blocking socket".to_owned())
                }
            })?;
        Ok(Box::new(tls))
    }
}
