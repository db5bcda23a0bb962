pub mod serdes;
pub mod signal;
pub mod strng;
pub mod telemetry;
pub mod version;

pub use strng::Strng;
