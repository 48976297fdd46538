pub mod bridge;
pub mod config;
pub mod error;
pub mod request;
pub mod session;
pub mod stream;
pub mod transport;
pub mod util;

#[cfg(test)]
mod test_util;
