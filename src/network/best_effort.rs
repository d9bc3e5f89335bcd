//! Best-effort corerpc client
//!
//! Wraps the blocking [`Client`] so network trouble degrades calls instead
//! of failing them: while the server is unreachable, calls return
//! `Ok(None)` and a background thread keeps retrying the connection at a
//! fixed interval. Remote exceptions still propagate as errors, since those
//! mean the call reached the server and failed there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{info, warn};

use super::{Client, ClientConfig, ClientError, ClientResult, TargetSelector};
use crate::pyon::Value;

struct Shared {
    client: Mutex<Option<Client>>,
    reconnecting: AtomicBool,
    terminated: Mutex<bool>,
    /// Cuts the retry wait short when the client is closed.
    wakeup: Condvar,
    host: String,
    port: u16,
    target: TargetSelector,
    config: ClientConfig,
}

impl Shared {
    fn is_terminated(&self) -> bool {
        *self.terminated.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Auto-reconnecting corerpc client
pub struct BestEffortClient {
    shared: Arc<Shared>,
    reconnect_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BestEffortClient {
    /// Connects, tolerating an unreachable server.
    ///
    /// The first attempt is bounded by `firstcon_timeout`; if it fails, the
    /// client starts in the disconnected state and retries in the
    /// background.
    pub fn connect(
        host: &str,
        port: u16,
        target: TargetSelector,
        config: ClientConfig,
    ) -> Self {
        let first_attempt = ClientConfig {
            connect_timeout_ms: config.firstcon_timeout_ms,
            ..config.clone()
        };
        let shared = Arc::new(Shared {
            client: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
            terminated: Mutex::new(false),
            wakeup: Condvar::new(),
            host: host.to_owned(),
            port,
            target,
            config,
        });
        let client = BestEffortClient {
            shared,
            reconnect_thread: Mutex::new(None),
        };
        match Client::connect_with(host, port, client.shared.target.clone(), &first_attempt, None)
        {
            Ok(connected) => {
                *client.shared.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(connected);
            }
            Err(e) => {
                warn!(
                    "first connection attempt to {}:{} failed ({}), retrying in the background",
                    host, port, e
                );
                client.start_reconnect();
            }
        }
        client
    }

    /// True while no connection is established.
    pub fn is_reconnecting(&self) -> bool {
        self.shared.reconnecting.load(Ordering::SeqCst)
    }

    /// Calls a remote method.
    ///
    /// `Ok(None)` means the server is unreachable and the call was dropped.
    /// Transport failures during the call also return `Ok(None)` after
    /// scheduling a reconnection.
    pub fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ClientResult<Option<Value>> {
        if self.is_reconnecting() {
            return Ok(None);
        }
        let mut guard = self
            .shared
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let client = match guard.as_mut() {
            Some(client) => client,
            None => return Ok(None),
        };
        match client.call(name, args, kwargs) {
            Ok(ret) => Ok(Some(ret)),
            Err(ClientError::Io(_) | ClientError::ConnectionLost | ClientError::Timeout) => {
                warn!("connection to {}:{} lost", self.shared.host, self.shared.port);
                *guard = None;
                drop(guard);
                self.start_reconnect();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn start_reconnect(&self) {
        if self
            .shared
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let shared = self.shared.clone();
        let handle = thread::spawn(move || reconnect_loop(shared));
        *self
            .reconnect_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Shuts down, cancelling any background reconnection.
    pub fn close(self) {
        *self
            .shared
            .terminated
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = true;
        self.shared.wakeup.notify_all();
        let handle = self
            .reconnect_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let client = self
            .shared
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(client) = client {
            let _ = client.close();
        }
    }
}

fn reconnect_loop(shared: Arc<Shared>) {
    loop {
        if shared.is_terminated() {
            shared.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        match Client::connect_with(
            &shared.host,
            shared.port,
            shared.target.clone(),
            &shared.config,
            None,
        ) {
            Ok(client) => {
                info!("reconnected to {}:{}", shared.host, shared.port);
                *shared.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
                shared.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                warn!(
                    "reconnection attempt to {}:{} failed: {}",
                    shared.host, shared.port, e
                );
            }
        }
        // wait out the retry interval, or wake immediately on close()
        let guard = shared.terminated.lock().unwrap_or_else(|e| e.into_inner());
        let _ = shared
            .wakeup
            .wait_timeout_while(guard, shared.config.retry(), |terminated| !*terminated)
            .unwrap_or_else(|e| e.into_inner());
    }
}
