//! Blocking corerpc client
//!
//! Synchronous counterpart of [`AsyncClient`](super::AsyncClient), built on
//! `std::net` for callers without an async runtime. The socket read timeout
//! bounds the connection and handshake; once handshaking succeeds the
//! timeout is lifted so steady-state calls block freely.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use tracing::{debug, info};

use crate::protocol::{Request, Response, TargetDoc, FEATURE_PYON_V2, INIT_BANNER, MAX_LINE_LEN};
use crate::pyon::{decode, encode, Value};

use super::{
    parse_identification, parse_method_list, select_target, BlockingSecureChannel, ClientConfig,
    ClientError, ClientResult, SyncStream, TargetSelector,
};

/// Chunked line reader over a blocking stream.
struct LineIo {
    stream: Box<dyn SyncStream>,
    buffer: Vec<u8>,
    scanned: usize,
}

impl LineIo {
    fn new(stream: Box<dyn SyncStream>) -> Self {
        LineIo {
            stream,
            buffer: Vec::new(),
            scanned: 0,
        }
    }

    /// Reads one line, without the terminator. `Ok(None)` on EOF.
    fn read_line(&mut self) -> ClientResult<Option<String>> {
        loop {
            if let Some(pos) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
                let pos = self.scanned + pos;
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                self.scanned = 0;
                let line = String::from_utf8(line)
                    .map_err(|_| ClientError::Protocol("line is not valid UTF-8".to_owned()))?;
                return Ok(Some(line));
            }
            self.scanned = self.buffer.len();
            if self.buffer.len() > MAX_LINE_LEN {
                return Err(ClientError::Protocol(format!(
                    "line exceeds {} bytes",
                    MAX_LINE_LEN
                )));
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        debug_assert!(!line.contains('\n'));
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()
    }

    fn exchange(&mut self, request: &Request) -> ClientResult<Value> {
        self.write_line(&encode(&request.to_value())?)?;
        let line = self.read_line()?.ok_or(ClientError::ConnectionLost)?;
        match Response::from_value(&decode(&line)?)? {
            Response::Ok(ret) => Ok(ret),
            Response::Failed(exception) => Err(ClientError::Remote(exception)),
        }
    }
}

/// Blocking corerpc client
pub struct Client {
    io: LineIo,
    /// Raw socket handle, kept for shutdown even when the stream is
    /// TLS-wrapped.
    control: TcpStream,
    target_name: String,
    description: Option<String>,
    methods: Vec<String>,
    closed: bool,
}

impl Client {
    /// Connects with default configuration over plain TCP.
    pub fn connect(host: &str, port: u16, target: TargetSelector) -> ClientResult<Self> {
        Self::connect_with(host, port, target, &ClientConfig::default(), None)
    }

    /// Connects with explicit configuration and an optional secure channel.
    pub fn connect_with(
        host: &str,
        port: u16,
        target: TargetSelector,
        config: &ClientConfig,
        secure: Option<&dyn BlockingSecureChannel>,
    ) -> ClientResult<Self> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ClientError::Protocol(format!("cannot resolve host {:?}", host)))?;
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout())?;
        stream.set_nodelay(true)?;
        // bound the handshake; lifted again below
        stream.set_read_timeout(Some(config.connect_timeout()))?;
        let control = stream.try_clone()?;

        let stream: Box<dyn SyncStream> = Box::new(stream);
        let stream = match secure {
            Some(channel) => channel.wrap_client(host, stream)?,
            None => stream,
        };
        let mut io = LineIo::new(stream);

        io.write_line(INIT_BANNER)?;
        let ident = parse_identification(&io.read_line()?.ok_or(ClientError::ConnectionLost)?)?;
        let target_name = select_target(&target, &ident.targets)?;
        io.write_line(&format!("{} {}", target_name, FEATURE_PYON_V2))?;
        let methods = parse_method_list(&io.read_line()?.ok_or(ClientError::ConnectionLost)?)?;

        control.set_read_timeout(None)?;
        info!("connected to target {:?} at {}:{}", target_name, host, port);

        Ok(Client {
            io,
            control,
            target_name,
            description: ident.description,
            methods,
            closed: false,
        })
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

    /// True once a transport failure has been observed; further calls fail
    /// fast without touching the socket.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn track<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        if matches!(
            result,
            Err(ClientError::Io(_) | ClientError::ConnectionLost)
        ) {
            self.closed = true;
        }
        result
    }

    /// Calls a remote method.
    pub fn call(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ClientResult<Value> {
        if self.closed {
            return Err(ClientError::ConnectionLost);
        }
        if !self.methods.iter().any(|m| m == name) {
            return Err(ClientError::MethodNotFound(name.to_owned()));
        }
        debug!("calling {}", name);
        let result = self.io.exchange(&Request::call(name, args, kwargs));
        self.track(result)
    }

    /// Fetches the target's method documentation.
    pub fn get_rpc_method_list(&mut self) -> ClientResult<TargetDoc> {
        if self.closed {
            return Err(ClientError::ConnectionLost);
        }
        let result = self.io.exchange(&Request::MethodList);
        let result = self.track(result)?;
        Ok(TargetDoc::from_value(&result)?)
    }

    /// Closes the connection.
    pub fn close(mut self) -> ClientResult<()> {
        self.closed = true;
        self.control.shutdown(Shutdown::Both)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Chunked {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            // one byte at a time, to exercise buffer accumulation
            if self.pos >= self.data.len() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    impl Write for Chunked {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_line_io_reassembles_chunks() {
        let mut io = LineIo::new(Box::new(Chunked {
            data: b"alpha\nbeta\ntail".to_vec(),
            pos: 0,
        }));
        assert_eq!(io.read_line().unwrap().unwrap(), "alpha");
        assert_eq!(io.read_line().unwrap().unwrap(), "beta");
        // partial trailing line without newline reads as EOF
        assert!(io.read_line().unwrap().is_none());
    }
}
