//! Protocol module - Defines the wire protocol for corerpc communication
//!
//! The protocol is newline-framed PYON text over a stream transport:
//! - Banner line identifying the protocol family and version
//! - Server identification line (targets, description, features)
//! - Client target selection line (`<target> <feature>...`)
//! - Method-name list line
//! - Request/response lines, one encoded document each

mod exception;
mod framing;
mod message;

pub use exception::*;
pub use framing::*;
pub use message::*;

/// Banner sent by the server as the first line of every connection.
pub const INIT_BANNER: &str = "corerpc 1";

/// Feature token for the PYON v2 encoding. Both sides must understand it.
pub const FEATURE_PYON_V2: &str = "pyon_v2";

/// Default port for corerpc servers.
pub const DEFAULT_PORT: u16 = 3251;

/// Upper bound on the length of a single protocol line.
pub const MAX_LINE_LEN: usize = 100 * 1024 * 1024;
