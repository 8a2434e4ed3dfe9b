//! Replication-Aware Table Acquisition
//!
//! Opening a table can fail for reasons that simply need waiting out: a
//! client node cannot see a table until the master has created it and the
//! creation has replicated. [`open_with_retry`] keeps trying with a fixed
//! backoff while the engine reports a transient failure
//! ([`EngineError::is_transient`]). Anything else is returned to the caller.
//!
//! Create rights are decided on every attempt from the current role, so a
//! node promoted to master while waiting creates the table on its next try.

use crate::error::{EngineError, Error, Result};
use crate::replication::NodeState;
use crate::storage::backend::{Engine, OpenOptions};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default delay between open attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Opens `name`, retrying transient failures until it succeeds or shutdown
/// is requested.
///
/// `options.create` is honoured only while this node is master. Returns
/// [`Error::ShuttingDown`] on shutdown and the engine error for any failure
/// that is not transient.
pub async fn open_with_retry<E: Engine>(
    engine: &E,
    state: &NodeState,
    name: &str,
    options: OpenOptions,
    backoff: Duration,
) -> Result<E::Table> {
    let mut attempts: u64 = 0;
    loop {
        if state.is_shutdown() {
            debug!(table = name, attempts, "Giving up on table open: shutting down");
            return Err(Error::ShuttingDown);
        }

        let attempt = options.with_create(options.create && state.is_master());
        attempts += 1;
        match engine.open(name, attempt) {
            Ok(table) => {
                if attempts > 1 {
                    debug!(table = name, attempts, "Table opened after retries");
                }
                return Ok(table);
            }
            Err(e) if e.is_transient() => {
                warn!(
                    op = "open",
                    table = name,
                    code = e.code(),
                    error = %e,
                    attempts,
                    "Could not open table, retrying"
                );
            }
            Err(e) => return Err(surface(name, attempts, e)),
        }

        if state.sleep_or_shutdown(backoff).await {
            debug!(table = name, attempts, "Giving up on table open: shutting down");
            return Err(Error::ShuttingDown);
        }
    }
}

fn surface(name: &str, attempts: u64, e: EngineError) -> Error {
    error!(
        op = "open",
        table = name,
        code = e.code(),
        error = %e,
        attempts,
        "Could not open table"
    );
    e.into()
}
