// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Managed-cluster side of joining a hub: the join protocol, certificate
//! renewal and the connection manager that persists the result.

pub mod connection;
pub mod join;
pub mod manager;
pub mod renewal;

pub use connection::ServerConnection;
pub use join::{request_client_cert, ClusterIdentity};
pub use manager::{ConnectionManager, ConnectionState};
pub use renewal::CertManager;
