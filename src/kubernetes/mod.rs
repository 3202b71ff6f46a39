// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes utilities: CRD discovery, client configs, caches, retries and untyped access.

pub mod client;
pub mod crd;
pub mod dynamic;
pub mod namespaces;
pub mod retry;
pub mod selector;
pub mod store;

pub use crd::{wait_for_crds, RequiredKind};
pub use namespaces::ensure_namespace_exists;
pub use retry::retry_on_conflict;
pub use store::{spawn_reflector, wait_synced};
