pub mod builder;
pub mod classifier;
pub mod config;
pub mod decoder;
pub mod entry;
pub mod error;
pub mod graph;
pub mod handler;
pub mod lift;
pub mod routine;
pub mod semantics;

pub use error::{Error, ErrorKind, Result};
