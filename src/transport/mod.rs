pub mod duplex;
pub mod handshake;
pub mod tcp;
