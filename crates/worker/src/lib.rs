//! `tablejob-worker`: command parsing and the demo handlers the binary
//! registers.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tablejob_core::{HandlerOutcome, HandlerRegistry, JobHandler, PayloadError, RetryLater, TypedJob};

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Poll the configured queue until stopped or `TABLEJOB_COUNT` is reached.
    Run,
    /// Print the configured queue's counts as JSON.
    Status,
    /// Insert `n` greeting jobs on the configured queue.
    EnqueueDemo(u32),
    /// Release every lease held under this host's worker identity.
    ReleaseLeases,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command `{0}` (expected run, status, enqueue-demo <n>, release-leases)")]
    Unknown(String),
    #[error("enqueue-demo expects a positive count, got `{0}`")]
    BadCount(String),
}

impl Command {
    /// Parse from the process arguments (without the program name).
    /// No arguments means [`Command::Run`].
    pub fn from_args<I, S>(args: I) -> Result<Self, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = args.into_iter();
        let Some(first) = args.next() else {
            return Ok(Self::Run);
        };

        match first.as_ref() {
            "enqueue-demo" => {
                let raw = args.next().map(|a| a.as_ref().to_string()).unwrap_or_else(|| "1".to_string());
                match raw.parse::<u32>() {
                    Ok(n) if n > 0 => Ok(Self::EnqueueDemo(n)),
                    _ => Err(CommandError::BadCount(raw)),
                }
            }
            other => other.parse(),
        }
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Self::Run),
            "status" => Ok(Self::Status),
            "release-leases" => Ok(Self::ReleaseLeases),
            "enqueue-demo" => Ok(Self::EnqueueDemo(1)),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// Logs a greeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
}

impl JobHandler for Hello {
    fn perform(&mut self) -> HandlerOutcome {
        info!(name = %self.name, "hello");
        HandlerOutcome::success()
    }
}

impl TypedJob for Hello {
    const TYPE: &'static str = "demo.hello";
}

/// Always fails with `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failing {
    pub message: String,
}

impl JobHandler for Failing {
    fn perform(&mut self) -> HandlerOutcome {
        HandlerOutcome::failed(self.message.clone())
    }

    fn on_final_failure(&mut self, error: &str) {
        warn!(error = %error, "demo job gave up");
    }
}

impl TypedJob for Failing {
    const TYPE: &'static str = "demo.failing";
}

/// Always asks to be retried after `delay_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snooze {
    pub delay_secs: u64,
}

impl JobHandler for Snooze {
    fn perform(&mut self) -> HandlerOutcome {
        RetryLater::new("snoozing")
            .with_delay(Duration::from_secs(self.delay_secs))
            .into()
    }
}

impl TypedJob for Snooze {
    const TYPE: &'static str = "demo.snooze";
}

/// Registry with every demo handler.
pub fn demo_registry() -> Result<HandlerRegistry, PayloadError> {
    HandlerRegistry::new()
        .with::<Hello>()?
        .with::<Failing>()?
        .with::<Snooze>()
}
