// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Hub controllers: join approval, dispatchers, health and cleanup.

pub mod cluster;
pub mod cluster_health;
pub mod garbage_collector;
pub mod join_approval;
pub mod rbac;
pub mod resource_view;
pub mod workset;

pub use cluster::ClusterReconciler;
pub use cluster_health::ClusterHealthMonitor;
pub use garbage_collector::GarbageCollector;
pub use join_approval::JoinApprovalReconciler;
pub use resource_view::ResourceViewReconciler;
pub use workset::WorkSetReconciler;
