//! # Wire Codec
//!
//! Extended JSON values, the protocol message catalogue, transport framing
//! and seeded id generation.

pub mod ejson;
pub mod errors;
pub mod framing;
pub mod message;
pub mod random;

pub use ejson::{fields_from_json, DocumentFields, EJson};
pub use errors::{DdpError, DdpResult};
pub use framing::{parse_message, Encapsulation, ServerFrame};
pub use message::{
    Baggage, ClientMessage, ErrorCode, ErrorPayload, ServerMessage, SUPPORTED_VERSIONS,
};
pub use random::{Random, RandomStream};
