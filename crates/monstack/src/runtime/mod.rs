// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime adapters.
//!
//! The reconciler talks to the runtime only through [`ContainerRuntime`].
//! [`DockerRuntime`] drives the `docker` CLI; [`MockRuntime`] is an in-memory
//! fake with an action log for tests.

pub mod docker;
pub mod mock;
mod traits;

pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use mock::MockRuntime;
pub use traits::*;
