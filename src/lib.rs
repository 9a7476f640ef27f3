pub mod ast;
pub mod db;
pub mod error;

pub use error::{Error, Result};

#[cfg(test)]
mod testing;
