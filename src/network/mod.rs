//! Network module - RPC transport over TCP/TLS
//!
//! Provides:
//! - Server hosting named targets for remote callers
//! - Async, blocking and auto-reconnecting clients
//! - Secure channel plumbing for TLS-wrapped connections

mod best_effort;
mod blocking;
mod client;
mod secure;
mod server;
mod session;

pub use best_effort::*;
pub use blocking::*;
pub use client::*;
pub use secure::*;
pub use server::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;

use crate::protocol::{
    LineError, MessageError, PackedException, ServerIdentification, FEATURE_PYON_V2,
};
use crate::pyon::{decode, DecodeError, EncodeError, Value};

/// Configuration for client connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection establishment and handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Time budget for the first attempt of a best-effort client
    pub firstcon_timeout_ms: u64,
    /// Interval between background reconnection attempts in milliseconds
    pub retry_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            firstcon_timeout_ms: 1000,
            retry_ms: 5000,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn firstcon_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.firstcon_timeout_ms)
    }

    pub fn retry(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_ms)
    }
}

/// Which of the server's targets to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    /// Use the only hosted target; fails if the server hosts several.
    Auto,
    Name(String),
}

impl TargetSelector {
    pub fn name(name: impl Into<String>) -> Self {
        TargetSelector::Name(name.into())
    }
}

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timeout")]
    Timeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server hosts {0} targets, a target name must be given")]
    AmbiguousTarget(usize),

    #[error("target {0:?} is not hosted by this server")]
    UnknownTarget(String),

    #[error("server does not support any common protocol features")]
    IncompatibleServer,

    #[error("target has no method {0:?}")]
    MethodNotFound(String),

    #[error("remote call failed: {0}")]
    Remote(#[source] PackedException),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl From<LineError> for ClientError {
    fn from(err: LineError) -> Self {
        match err {
            LineError::Io(e) => ClientError::Io(e),
            other => ClientError::Protocol(other.to_string()),
        }
    }
}

impl From<MessageError> for ClientError {
    fn from(err: MessageError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

/// True for I/O errors that mean the peer went away rather than anything
/// being wrong locally.
pub(crate) fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// A bidirectional async byte stream, plain or TLS-wrapped.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A one-shot event that tasks can wait on, used for server termination
/// requested over the wire.
#[derive(Clone, Default)]
pub struct TerminateEvent {
    inner: Arc<TerminateInner>,
}

#[derive(Default)]
struct TerminateInner {
    set: AtomicBool,
    notify: Notify,
}

impl TerminateEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.set.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.inner.notify.notified();
            // re-check so a set() between the load and notified() is not lost
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Resolves a target selector against the names a server advertised.
pub(crate) fn select_target(
    selector: &TargetSelector,
    targets: &[String],
) -> ClientResult<String> {
    match selector {
        TargetSelector::Auto => match targets {
            [only] => Ok(only.clone()),
            _ => Err(ClientError::AmbiguousTarget(targets.len())),
        },
        TargetSelector::Name(name) => {
            if targets.iter().any(|t| t == name) {
                Ok(name.clone())
            } else {
                Err(ClientError::UnknownTarget(name.clone()))
            }
        }
    }
}

/// Parses the identification line and verifies a common encoding feature.
pub(crate) fn parse_identification(line: &str) -> ClientResult<ServerIdentification> {
    let ident = ServerIdentification::from_value(&decode(line)?)?;
    if !ident.features.iter().any(|f| f == FEATURE_PYON_V2) {
        return Err(ClientError::IncompatibleServer);
    }
    Ok(ident)
}

/// Parses the method-name list line.
pub(crate) fn parse_method_list(line: &str) -> ClientResult<Vec<String>> {
    let names = decode(line)?;
    let names = match &names {
        Value::List(items) | Value::Tuple(items) | Value::Set(items) => items,
        _ => {
            return Err(ClientError::Protocol(
                "method list is not a sequence".to_owned(),
            ))
        }
    };
    names
        .iter()
        .map(|n| {
            n.as_str()
                .map(str::to_owned)
                .ok_or_else(|| ClientError::Protocol("method name is not a string".to_owned()))
        })
        .collect()
}
