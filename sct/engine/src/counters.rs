// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};

pub static RUNS_EXPLORED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sct_runs_explored",
        "Number of schedules executed by the exploration driver"
    )
    .unwrap()
});

pub static RUNS_BOUND_ABORTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sct_runs_bound_aborted",
        "Number of runs cut short by a preemption, fairness or length bound"
    )
    .unwrap()
});

pub static SNAPSHOT_RESTORES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sct_snapshot_restores",
        "Number of times exploration resumed from a captured prelude state"
    )
    .unwrap()
});

pub static SIMPLIFICATION_PASSES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sct_simplification_passes",
        "Number of rewrite passes applied to failing traces"
    )
    .unwrap()
});

pub static SIMPLIFICATION_DIVERGENCES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "sct_simplification_divergences",
        "Simplified traces whose replay produced a different outcome"
    )
    .unwrap()
});
