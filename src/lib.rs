#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod server;
pub mod service;
pub mod wire;
pub mod xclient;

pub use client::{Call, Client};
pub use codec::{Codec, Encoding, JsonCodec, PostcardCodec};
pub use discovery::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode};
pub use error::Error;
pub use registry::{heartbeat, Registry};
pub use server::Server;
pub use service::{HandlerError, Service, ServiceBuilder};
pub use wire::{Header, Options, MAGIC};
pub use xclient::{xdial, XClient};
