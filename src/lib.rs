#[macro_use]
extern crate async_trait;

#[cfg(test)]
pub(crate) mod test_util;

pub mod backend;
pub mod config;
pub mod engine;
pub mod operation;
pub mod rate_limiter;
pub mod run;
pub mod stats;
