// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

pub mod action;
pub mod failure;
pub mod ids;
pub mod trace;

pub use action::{Action, Lookahead, MaskingState};
pub use failure::{Failure, Outcome};
pub use ids::{CellId, IdSource, MVarId, TVarId, ThreadId};
pub use trace::{Decision, Trace, TraceEvent};
