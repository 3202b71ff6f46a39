// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The per-cluster agent: runs Works, publishes status, serves logs and metrics.

pub mod capacity;
pub mod helm;
pub mod masters;
pub mod server;
pub mod status;
pub mod work;

pub use server::KlusterletServer;
pub use status::StatusPublisher;
pub use work::WorkReconciler;
