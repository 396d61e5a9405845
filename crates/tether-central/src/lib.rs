//! Async central and peripheral commands on top of callback-driven radio drivers.
//!
//! A driver implements [`CentralDriver`] or [`PeripheralDriver`] to issue
//! native commands, and reports their outcomes through the matching
//! callbacks handle. Callers only see `async fn`s.

use std::fmt;
use std::time::Duration;

use tether::{ExecutorError, Pending};

pub(crate) mod central;
pub(crate) mod config;
pub(crate) mod driver;
pub(crate) mod error;
pub(crate) mod model;
pub(crate) mod peripheral;

pub use self::central::{Central, CentralCallbacks, ScanStream};
pub use self::config::*;
pub use self::driver::{CentralDriver, PeripheralDriver};
pub use self::error::{CentralError, UnavailableReason};
pub use self::model::*;
pub use self::peripheral::{Peripheral, PeripheralCallbacks};

/// Awaits `pending`, giving up with [`CentralError::Timeout`] after `limit`.
///
/// Giving up drops the request, which takes it off its executor.
pub(crate) async fn bounded<T>(
    limit: Option<Duration>,
    pending: Pending<T, CentralError>,
) -> Result<T, CentralError>
where
    T: Send + 'static,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, pending)
            .await
            .map_err(|_| CentralError::Timeout)?,
        None => pending.await,
    }
}

/// Logs a driver completion that found nobody waiting for it.
pub(crate) fn log_stray(result: Result<(), ExecutorError>, callback: &str, target: &dyn fmt::Display) {
    if let Err(err) = result {
        tracing::warn!(%target, %err, "{callback} without a pending request");
    }
}
