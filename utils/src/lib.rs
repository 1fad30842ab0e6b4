// Support code shared by the compositor binary and the render core
pub mod fdwatch;
#[macro_use]
pub mod logging;
pub mod log;
pub mod timing;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};
