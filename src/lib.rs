pub mod check;
pub mod config;
pub mod device;
pub mod error;
pub mod fat;
pub mod fs;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{FatError, Result};
