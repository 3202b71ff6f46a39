// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod klusterlet;
pub mod kubernetes;
pub mod permission;
pub mod pki;
pub mod reconcilers;
pub mod registry;
pub mod reloader;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
