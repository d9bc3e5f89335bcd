//! corerpc Server
//!
//! Hosts named targets and answers remote calls. One tokio task per
//! connection, tracked in a `JoinSet` so `stop` can cancel and await them.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::target::Targets;

use super::session::{handle_session, SessionShared};
use super::{SecureChannel, TerminateEvent};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server already running")]
    AlreadyRunning,

    #[error("server not running")]
    NotRunning,
}

pub type ServerResult<T> = Result<T, ServerError>;

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// corerpc Server
pub struct Server {
    targets: Arc<Targets>,
    description: Option<String>,
    builtin_terminate: bool,
    allow_parallel: bool,
    secure: Option<Arc<dyn SecureChannel>>,
    terminate: TerminateEvent,
    running: Option<Running>,
}

impl Server {
    /// Creates a server hosting the given targets. Calls from different
    /// connections are serialized unless [`Server::with_allow_parallel`]
    /// is used.
    pub fn new(targets: Targets) -> Self {
        Server {
            targets: Arc::new(targets),
            description: None,
            builtin_terminate: false,
            allow_parallel: false,
            secure: None,
            terminate: TerminateEvent::new(),
            running: None,
        }
    }

    /// Free-form description sent in the identification line.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Lets clients stop the server by calling `terminate`.
    pub fn with_builtin_terminate(mut self) -> Self {
        self.builtin_terminate = true;
        self
    }

    /// Runs calls from different connections concurrently. Only safe when
    /// the targets tolerate interleaved invocations.
    pub fn with_allow_parallel(mut self) -> Self {
        self.allow_parallel = true;
        self
    }

    /// Wraps every accepted connection with the given secure channel.
    pub fn with_secure_channel(mut self, channel: Arc<dyn SecureChannel>) -> Self {
        self.secure = Some(channel);
        self
    }

    /// Binds and starts accepting connections.
    pub async fn start(&mut self, bind_addr: &str) -> ServerResult<()> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("server listening on {}", local_addr);

        let shared = Arc::new(SessionShared {
            targets: self.targets.clone(),
            description: self.description.clone(),
            builtin_terminate: self.builtin_terminate,
            sequential: if self.allow_parallel {
                None
            } else {
                Some(tokio::sync::Mutex::new(()))
            },
            terminate: self.terminate.clone(),
            secure: self.secure.clone(),
        });

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let accept_task = tokio::spawn(async move {
            let mut sessions = JoinSet::new();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                debug!("new connection from {}", addr);
                                let shared = shared.clone();
                                sessions.spawn(async move {
                                    if let Err(e) = handle_session(stream, addr, shared).await {
                                        debug!("session with {} failed: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("accept error: {}", e);
                            }
                        }
                    }
                    Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                    _ = shutdown_rx.recv() => {
                        debug!("server shutdown requested");
                        break;
                    }
                }
            }
            sessions.shutdown().await;
        });

        self.running = Some(Running {
            local_addr,
            shutdown_tx,
            accept_task,
        });
        Ok(())
    }

    /// The bound address, once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Stops accepting and tears down every live session.
    pub async fn stop(&mut self) -> ServerResult<()> {
        let running = self.running.take().ok_or(ServerError::NotRunning)?;
        let _ = running.shutdown_tx.send(()).await;
        let _ = running.accept_task.await;
        info!("server stopped");
        Ok(())
    }

    /// Completes once a client has requested termination.
    pub async fn wait_terminate(&self) {
        self.terminate.wait().await
    }

    /// Handle to the termination event, for wiring into other shutdown
    /// machinery.
    pub fn terminate_event(&self) -> TerminateEvent {
        self.terminate.clone()
    }
}
