// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The ways a single run can fail. Reported as the `Err` side of an
/// [`Outcome`]; a failure never aborts exploration by itself.
#[derive(Clone, Debug, Error, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum Failure {
    #[error("deadlock: no thread is runnable and at least one is blocked")]
    Deadlock,

    #[error("stm deadlock: the only remaining thread is blocked in an stm retry with no writers")]
    StmDeadlock,

    #[error("internal invariant violated: {message}")]
    InternalError { message: String },

    #[error("uncaught exception on the root thread: {exception}")]
    UncaughtException { exception: String },

    #[error("illegal subconcurrency: nested, or used inside a dont-check prelude")]
    IllegalSubconcurrency,

    #[error("dont-check prelude used anywhere but at the start of the computation")]
    IllegalDontCheck,

    #[error("bound threads are not supported by this execution substrate")]
    UnsupportedBoundThread,

    #[error("run aborted: the scheduler gave up, or the prelude exceeded its bound")]
    Abort,
}

impl Failure {
    /// Returns a summary label for the failure. When no user equality is
    /// supplied, two failed outcomes are considered duplicates iff their
    /// labels match.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Deadlock => "deadlock",
            Self::StmDeadlock => "stm_deadlock",
            Self::InternalError { .. } => "internal_error",
            Self::UncaughtException { .. } => "uncaught_exception",
            Self::IllegalSubconcurrency => "illegal_subconcurrency",
            Self::IllegalDontCheck => "illegal_dont_check",
            Self::UnsupportedBoundThread => "unsupported_bound_thread",
            Self::Abort => "abort",
        }
    }

    pub fn internal(message: impl ToString) -> Self {
        Self::InternalError {
            message: message.to_string(),
        }
    }
}

/// The result of one run: the root thread's final value (if it produced
/// one), or a failure.
pub type Outcome<V> = Result<Option<V>, Failure>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn labels_collapse_payloads() {
        assert_eq!(
            Failure::internal("one").kind_label(),
            Failure::internal("two").kind_label()
        );
        assert_ne!(
            Failure::Deadlock.kind_label(),
            Failure::StmDeadlock.kind_label()
        );
    }
}
