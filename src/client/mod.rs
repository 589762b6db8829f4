//! # DDP Client
//!
//! Client side of the protocol: method calls, subscriptions and a local
//! cache of the documents the server publishes.

pub mod clock_sync;
pub mod collection;
pub mod ddp_client;
pub mod errors;
pub mod selector;

pub use clock_sync::discover_clock_offset;
pub use collection::{CollectionHandle, LocalCollection};
pub use ddp_client::{channel_inbound, DdpClient, InboundStream};
pub use errors::{ClientError, ClientResult};
pub use selector::{FindOptions, Projection, Selector};
