//! Planewire - typed binary API client for a vector packet-processing
//! dataplane
//!
//! The dataplane speaks a fixed binary wire format with no type tags:
//! a message's schema alone determines its layout, and per-message
//! CRC32 fingerprints detect wire-incompatible schema drift between
//! client and dataplane. This crate provides:
//! - Explicit message schemas and module descriptors (`schema`)
//! - A process-wide immutable schema registry (`registry`)
//! - A schema-driven binary codec (`codec`)
//! - Request/reply, dump-stream and event correlation (`channel`)
//!
//! Transport is a seam: the channel works over anything that can carry
//! frames, from a shared-memory ring to a socket.

pub mod channel;
pub mod codec;
pub mod config;
pub mod registry;
pub mod schema;

pub use channel::{
    Channel, ChannelError, ChannelResult, DumpStream, EventSubscription, InboundFrame,
    LoopbackPeer, LoopbackTransport, ModuleVersion, OutboundFrame, Transport,
};
pub use codec::{decode, encode, CodecError, CodecResult, Record, Value};
pub use config::{Config, ConfigError, ExchangeConfig};
pub use registry::{Registry, RegistryBuilder, RegistryError, RegistryResult};
pub use schema::{
    ArrayMode, FieldKind, FieldLayout, MessageKind, MessageSchema, ModuleDescriptor, ScalarKind,
    SchemaError, SchemaResult, StructLayout,
};
