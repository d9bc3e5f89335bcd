//! Async corerpc client
//!
//! Connects to a server, selects a target and issues calls. One request is
//! in flight at a time; concurrent callers are serialized on an internal
//! lock, matching the one-line-request one-line-response framing.

use std::time::Duration;

use tokio::io::{BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::protocol::{read_line, write_line, Request, Response, TargetDoc, INIT_BANNER};
use crate::pyon::{decode, encode, Value};

use super::{
    parse_identification, parse_method_list, select_target, AsyncStream, ClientConfig,
    ClientError, ClientResult, SecureChannel, TargetSelector,
};

struct Io {
    reader: BufReader<ReadHalf<Box<dyn AsyncStream>>>,
    writer: WriteHalf<Box<dyn AsyncStream>>,
}

impl Io {
    async fn exchange(&mut self, request: &Request) -> ClientResult<Value> {
        write_line(&mut self.writer, &encode(&request.to_value())?).await?;
        let line = read_line(&mut self.reader)
            .await?
            .ok_or(ClientError::ConnectionLost)?;
        match Response::from_value(&decode(&line)?)? {
            Response::Ok(ret) => Ok(ret),
            Response::Failed(exception) => Err(ClientError::Remote(exception)),
        }
    }
}

/// Async corerpc client
pub struct AsyncClient {
    io: Mutex<Io>,
    target_name: String,
    description: Option<String>,
    methods: Vec<String>,
}

impl AsyncClient {
    /// Connects with default configuration over plain TCP.
    pub async fn connect(host: &str, port: u16, target: TargetSelector) -> ClientResult<Self> {
        Self::connect_with(host, port, target, &ClientConfig::default(), None).await
    }

    /// Connects with explicit configuration and an optional secure channel.
    pub async fn connect_with(
        host: &str,
        port: u16,
        target: TargetSelector,
        config: &ClientConfig,
        secure: Option<&dyn SecureChannel>,
    ) -> ClientResult<Self> {
        let connect = async {
            let stream = TcpStream::connect((host, port)).await?;
            stream.set_nodelay(true)?;
            let stream: Box<dyn AsyncStream> = Box::new(stream);
            let stream = match secure {
                Some(channel) => channel.wrap_client(host, stream).await?,
                None => stream,
            };
            let (reader, writer) = tokio::io::split(stream);
            let mut io = Io {
                reader: BufReader::new(reader),
                writer,
            };
            let (target_name, description, methods) = handshake(&mut io, &target).await?;
            info!("connected to target {:?} at {}:{}", target_name, host, port);
            Ok(AsyncClient {
                io: Mutex::new(io),
                target_name,
                description,
                methods,
            })
        };
        match tokio::time::timeout(config.connect_timeout(), connect).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Name of the selected target.
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Description the server sent in its identification line.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Method names the target advertised during the handshake.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Calls a remote method.
    ///
    /// `ClientError::Remote` means the method itself failed on the other
    /// side; every other error is transport or protocol trouble.
    pub async fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ClientResult<Value> {
        if !self.methods.iter().any(|m| m == name) {
            return Err(ClientError::MethodNotFound(name.to_owned()));
        }
        debug!("calling {}", name);
        let mut io = self.io.lock().await;
        io.exchange(&Request::call(name, args, kwargs)).await
    }

    /// Fetches the target's method documentation.
    pub async fn get_rpc_method_list(&self) -> ClientResult<TargetDoc> {
        let mut io = self.io.lock().await;
        let ret = io.exchange(&Request::MethodList).await?;
        Ok(TargetDoc::from_value(&ret)?)
    }

    /// Closes the connection.
    pub async fn close(self) -> ClientResult<()> {
        use tokio::io::AsyncWriteExt;
        let mut io = self.io.into_inner();
        io.writer.shutdown().await?;
        Ok(())
    }
}

async fn handshake(
    io: &mut Io,
    target: &TargetSelector,
) -> ClientResult<(String, Option<String>, Vec<String>)> {
    write_line(&mut io.writer, INIT_BANNER).await?;

    let ident_line = read_line(&mut io.reader)
        .await?
        .ok_or(ClientError::ConnectionLost)?;
    let ident = parse_identification(&ident_line)?;
    let target_name = select_target(target, &ident.targets)?;

    write_line(
        &mut io.writer,
        &format!("{} {}", target_name, crate::protocol::FEATURE_PYON_V2),
    )
    .await?;

    let methods_line = read_line(&mut io.reader)
        .await?
        .ok_or(ClientError::ConnectionLost)?;
    let methods = parse_method_list(&methods_line)?;

    Ok((target_name, ident.description, methods))
}

/// Reads a server's identification without selecting a target.
///
/// Useful for tooling that only needs to know what a server hosts.
pub async fn inspect_server(
    host: &str,
    port: u16,
    config: &ClientConfig,
) -> ClientResult<crate::protocol::ServerIdentification> {
    let inspect = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        write_line(&mut stream, INIT_BANNER).await?;
        let mut reader = BufReader::new(stream);
        let ident_line = read_line(&mut reader)
            .await?
            .ok_or(ClientError::ConnectionLost)?;
        parse_identification(&ident_line)
    };
    match tokio::time::timeout(config.connect_timeout(), inspect).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout),
    }
}
