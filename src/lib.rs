#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
pub mod channels;
pub mod error;
pub mod session;
#[cfg(test)]
pub(crate) mod test_support;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use session::RealtimeSession;
