pub mod config;
pub mod streams;
pub mod voice;

pub use config::*;
pub use streams::*;
pub use voice::*;
