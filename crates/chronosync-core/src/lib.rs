//! Chronosync Core - Domain logic and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `ActivityRecord`, `SyncOperation`
//! - **Port definitions** - Traits for adapters: `IStateRepository`,
//!   `IRemoteClient`, `IConnectivityMonitor`, `ISyncScheduler`
//! - **Backoff policy** - Tiered fixed retry delays for queued operations
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no storage or network
//! dependencies. Ports define trait interfaces that adapter crates implement:
//! the SQLite cache implements `IStateRepository`, while the sync crate
//! provides the dispatcher, connectivity monitor, and scheduler built on top
//! of these ports.

pub mod config;
pub mod domain;
pub mod ports;
