//! Handler capability: what a queued job does when it runs.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::outcome::HandlerOutcome;

/// A unit of work reconstructed from the `handler` column.
///
/// `perform` is the single execution entry point and runs synchronously on
/// the worker's thread. A panic inside `perform` is treated as a plain
/// failure by the executor.
pub trait JobHandler: Send {
    fn perform(&mut self) -> HandlerOutcome;

    /// Called once when the job has used up its attempts and is marked failed.
    fn on_final_failure(&mut self, _error: &str) {}
}

/// A handler that can be stored in and restored from the jobs table.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendReceipt { order_id: i64 }
///
/// impl JobHandler for SendReceipt {
///     fn perform(&mut self) -> HandlerOutcome { HandlerOutcome::success() }
/// }
///
/// impl TypedJob for SendReceipt {
///     const TYPE: &'static str = "billing.send_receipt";
/// }
/// ```
pub trait TypedJob: JobHandler + Serialize + DeserializeOwned + 'static {
    /// Type identifier written in front of the serialized body.
    ///
    /// Must be unique within a registry and must not contain `:`.
    const TYPE: &'static str;
}
