#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod error;
mod options;
mod pool;
mod registry;
pub(crate) mod runtime;
mod service;

pub use crate::{
    error::{Error, ErrorKind, Result},
    options::{Jitter, SessionPoolOptions, WaitBehavior},
    pool::{PoolStatistics, PooledSession, SessionKind, SessionPool},
    registry::PoolRegistry,
    service::{CreatedSession, SessionService, TransactionId},
};
