//! Durable stream transport and the buffered event publisher.

pub mod client;
pub mod memory;
pub mod publisher;
pub mod snapshot;

pub use client::{DurableStream, HttpStreamClient};
pub use memory::MemoryStream;
pub use publisher::{DeadLetter, StreamPublisher};
pub use snapshot::{SessionSnapshot, SnapshotSource, StreamSnapshotSource};
