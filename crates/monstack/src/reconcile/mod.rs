// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Desired-state reconciliation for managed services.

mod planner;
mod probe;
mod reconciler;

pub use planner::{Plan, is_converged, plan, recovery_plan};
pub use probe::{Observation, Probe, RuntimeObservation};
pub use reconciler::{Outcome, ReconcileReport, Reconciler, ReconcilerConfig, ServiceReport};
