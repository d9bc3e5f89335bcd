//! Server-side connection state machine
//!
//! One session per accepted connection:
//! 1. read and validate the client's banner line,
//! 2. send the identification line,
//! 3. read the client's target selection and feature tokens,
//! 4. send the method-name list,
//! 5. answer request lines until the client goes away.
//!
//! A malformed banner exchange closes the connection silently. A malformed
//! request line gets a `failed` response and the session continues; only
//! transport failures and a `terminate` request end it.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::protocol::{
    read_line, write_line, LineError, PackedException, Request, Response, ServerIdentification,
    FEATURE_PYON_V2, INIT_BANNER,
};
use crate::pyon::{decode, encode, EncodeError, Value};
use crate::target::{document_target, Target, Targets};

use super::{is_disconnect, AsyncStream, SecureChannel, TerminateEvent};

/// State shared by every session of one server.
pub(crate) struct SessionShared {
    pub(crate) targets: Arc<Targets>,
    pub(crate) description: Option<String>,
    pub(crate) builtin_terminate: bool,
    /// Present when calls must not run in parallel across sessions.
    pub(crate) sequential: Option<Mutex<()>>,
    pub(crate) terminate: TerminateEvent,
    pub(crate) secure: Option<Arc<dyn SecureChannel>>,
}

#[derive(Error, Debug)]
pub(crate) enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Line(#[from] LineError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl SessionError {
    fn is_disconnect(&self) -> bool {
        match self {
            SessionError::Io(e) | SessionError::Line(LineError::Io(e)) => is_disconnect(e),
            _ => false,
        }
    }
}

pub(crate) async fn handle_session(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<SessionShared>,
) -> Result<(), SessionError> {
    stream.set_nodelay(true)?;
    let stream: Box<dyn AsyncStream> = Box::new(stream);
    let stream = match &shared.secure {
        Some(channel) => channel
            .wrap_server(stream)
            .await
            .map_err(|e| SessionError::Tls(e.to_string()))?,
        None => stream,
    };
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    match run_session(&mut reader, &mut writer, addr, &shared).await {
        Err(e) if e.is_disconnect() => {
            debug!("session with {} ended by peer", addr);
            Ok(())
        }
        other => other,
    }
}

async fn run_session<W>(
    reader: &mut BufReader<tokio::io::ReadHalf<Box<dyn AsyncStream>>>,
    writer: &mut W,
    addr: SocketAddr,
    shared: &SessionShared,
) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let banner = match read_line(reader).await? {
        Some(line) => line,
        None => return Ok(()),
    };
    if banner.trim_end() != INIT_BANNER {
        debug!("{} sent an unrecognized banner, closing", addr);
        return Ok(());
    }
    let ident = ServerIdentification {
        targets: shared.targets.names(),
        description: shared.description.clone(),
        features: vec![FEATURE_PYON_V2.to_owned()],
    };
    write_line(writer, &encode(&ident.to_value())?).await?;

    let selection = match read_line(reader).await? {
        Some(line) => line,
        None => return Ok(()),
    };
    let mut words = selection.split_whitespace();
    let target_name = match words.next() {
        Some(name) => name.to_owned(),
        None => {
            debug!("{} sent an empty target selection, closing", addr);
            return Ok(());
        }
    };
    let mut pyon_v2 = false;
    for feature in words {
        if feature == FEATURE_PYON_V2 {
            pyon_v2 = true;
        } else {
            debug!("{} requested unsupported feature {:?}, closing", addr, feature);
            return Ok(());
        }
    }
    if !pyon_v2 {
        debug!("{} offers no common encoding, closing", addr);
        return Ok(());
    }
    let target = match shared.targets.get(&target_name) {
        Some(entry) => entry.instantiate(),
        None => {
            debug!("{} requested unknown target {:?}, closing", addr, target_name);
            return Ok(());
        }
    };

    let mut methods = target.method_list();
    if shared.builtin_terminate {
        methods.push("terminate".to_owned());
    }
    methods.sort();
    write_line(
        writer,
        &encode(&Value::list(methods.into_iter().map(Value::Str)))?,
    )
    .await?;
    info!("serving target {:?} to {}", target_name, addr);

    loop {
        let line = match read_line(reader).await? {
            Some(line) => line,
            None => return Ok(()),
        };
        let response = match process_line(&line, target.as_ref(), shared).await {
            Some(response) => response,
            None => {
                // terminate requested, close without responding
                return Ok(());
            }
        };
        let encoded = match encode(&response.to_value()) {
            Ok(encoded) => encoded,
            Err(e) => {
                // the return value was not serializable, report that instead
                let failed = Response::Failed(PackedException::from_error("EncodeError", &e));
                encode(&failed.to_value())?
            }
        };
        write_line(writer, &encoded).await?;
    }
}

/// Handles one request line. `None` means the session must close without a
/// response (builtin terminate).
async fn process_line(
    line: &str,
    target: &dyn Target,
    shared: &SessionShared,
) -> Option<Response> {
    let request = match decode(line).map_err(Into::into).and_then(|v| {
        Request::from_value(&v).map_err(RequestError::from)
    }) {
        Ok(request) => request,
        Err(e) => {
            debug!("malformed request: {}", e);
            return Some(Response::Failed(PackedException::from_error(
                "RequestError",
                &e,
            )));
        }
    };

    // one lock for every request kind, across all sessions
    let _guard = match &shared.sequential {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };

    match request {
        Request::MethodList => {
            let mut doc = document_target(target);
            if shared.builtin_terminate {
                doc.methods.push((
                    "terminate".to_owned(),
                    crate::protocol::MethodDoc {
                        argspec: Default::default(),
                        doc: Some("Closes the connection and stops the server.".to_owned()),
                    },
                ));
            }
            Some(Response::Ok(doc.to_value()))
        }
        Request::Call { name, args, kwargs } => {
            if shared.builtin_terminate && name == "terminate" {
                info!("terminate requested over the wire");
                shared.terminate.set();
                return None;
            }
            debug!("call {}({} args, {} kwargs)", name, args.len(), kwargs.len());
            Some(match target.invoke(&name, args, kwargs).await {
                Ok(ret) => Response::Ok(ret),
                Err(exception) => Response::Failed(exception),
            })
        }
    }
}

/// Why a request line could not be turned into a request.
#[derive(Error, Debug)]
enum RequestError {
    #[error(transparent)]
    Decode(#[from] crate::pyon::DecodeError),

    #[error(transparent)]
    Message(#[from] crate::protocol::MessageError),
}
