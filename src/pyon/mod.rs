//! PYON value codec - serialization with type fidelity
//!
//! Provides encoding and decoding between [`Value`] trees and the PYON wire
//! text, a superset of JSON:
//! - Human-readable, fully compatible with JSON for the plain JSON subset.
//! - Compact form is single-line, ASCII-only (safe for newline framing).
//! - Type fidelity: tuples do not become lists, mapping keys are not turned
//!   into strings, and `decode(encode(v))` reconstructs `v` exactly.
//! - Supports N-dimensional numeric arrays and fixed-width scalars.
//! - Extensible with custom type encoders/decoders via [`TypeRegistry`].

mod codec;
mod registry;
mod store;
mod value;

pub use codec::{decode, decode_with, encode, encode_pretty, encode_with, DecodeError, EncodeError};
pub use registry::{registry, CodecPlugin, DecodeFn, Opaque, RegistryError, TypeRegistry};
pub use store::{load_file, store_file, StoreError};
pub use value::{ArrayElement, NdArray, Scalar, ScalarKind, Value, ValueError};

/// Maximum nesting depth accepted by the decoder.
pub const MAX_DEPTH: usize = 128;
