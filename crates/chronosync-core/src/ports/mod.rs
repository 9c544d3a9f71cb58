//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the domain core
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IStateRepository`] - Local activity cache and durable sync queue
//! - [`IRemoteClient`] - Remote store of record (abstract transport)
//! - [`IConnectivityMonitor`] - Network reachability observation
//! - [`ISyncScheduler`] - Deferred-task scheduling for queue drains

pub mod connectivity;
pub mod remote_client;
pub mod scheduler;
pub mod state_repository;

pub use connectivity::{ConnectivityStatus, ConnectivityStream, IConnectivityMonitor};
pub use remote_client::{IRemoteClient, RemoteError, RemoteRecord};
pub use scheduler::ISyncScheduler;
pub use state_repository::IStateRepository;
