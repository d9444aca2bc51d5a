//! Database pool setup shared by UMIG services

pub mod init;

pub use init::*;
