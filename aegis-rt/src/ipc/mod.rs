//! Inter-task communication
//!
//! Two layers: the single-producer/single-consumer ring buffers over a
//! shared dataspace (the bulk-data path), and the service/session
//! framework over portals (the control path).

mod client;
mod packet;
mod ring;
pub(crate) mod service;

pub use client::ClientSession;
pub use packet::{PacketConsumer, PacketProducer};
pub use ring::{Consumer, Producer, RING_HEADER_SIZE};
pub use service::{Command, Service, ServiceSession, SessionId};

pub(crate) use ring::RingHeader;
