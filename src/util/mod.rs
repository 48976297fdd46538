pub mod monitor;
pub mod safe_converter;
