pub mod actors;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod resource;
pub mod shell;
pub mod util;

pub use error::{Error, Result};
