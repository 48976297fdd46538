//! In-memory transports for exercising bridges without sockets. Pipes are created with
//!  `tokio::io::duplex`, so they work with paused time.

pub mod bridge;
pub mod stream_maker;
