mod error;
mod pool;
pub mod protocol;
pub mod server;
mod session;

pub use crate::{
    error::SinewError,
    pool::{Client, Config},
    protocol::{Param, Reply, Request},
    session::{Session, Transaction},
};
