//! corerpc - line-framed RPC over TCP/TLS with a type-preserving codec
//!
//! A server hosts named *targets* - bundles of callable methods - and
//! answers newline-framed request lines. Payloads travel as PYON, a
//! JSON superset that keeps tuples, sets, byte strings, non-string mapping
//! keys, non-finite floats, fractions, complex numbers and numeric arrays
//! intact across the wire.
//!
//! Three client flavors cover the usual deployment shapes:
//! - [`AsyncClient`] for tokio applications,
//! - [`Client`] for plain blocking code,
//! - [`BestEffortClient`] when the caller must keep running while the
//!   server is down.
//!
//! ```no_run
//! use std::sync::Arc;
//! use corerpc::{Server, Targets};
//! # use corerpc::{Target, Value, PackedException};
//! # struct Echo;
//! # #[async_trait::async_trait]
//! # impl Target for Echo {
//! #     fn method_list(&self) -> Vec<String> { vec!["echo".into()] }
//! #     async fn invoke(&self, _: &str, mut args: Vec<Value>, _: Vec<(String, Value)>)
//! #         -> Result<Value, PackedException> { Ok(args.pop().unwrap_or(Value::None)) }
//! # }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut targets = Targets::new();
//! targets.add_instance("echo", Arc::new(Echo))?;
//! let mut server = Server::new(targets).with_builtin_terminate();
//! server.start("127.0.0.1:3251").await?;
//! server.wait_terminate().await;
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod network;
pub mod protocol;
pub mod pyon;
pub mod target;

pub use network::{
    AsyncClient, BestEffortClient, Client, ClientConfig, ClientError, ClientResult,
    NativeTlsChannel, Server, ServerError, TargetSelector,
};
pub use protocol::PackedException;
pub use pyon::Value;
pub use target::{Target, TargetError, Targets};
