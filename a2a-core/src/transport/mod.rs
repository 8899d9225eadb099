//! Transports bundled with the core. Real network transports live outside
//! this crate and only need to implement [`crate::protocol::ProtocolHandler`].

pub mod memory;

pub use memory::MemoryHandler;
