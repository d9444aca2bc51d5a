//! Utility modules for umig-import

pub mod db_retry;
pub mod tx_monitor;

pub use db_retry::retry_on_lock;
pub use tx_monitor::{begin_monitored, MonitoredTransaction};
