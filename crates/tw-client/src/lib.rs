//! # taskwatch client
//!
//! Keeps a local view of backend task status in sync. Updates arrive over a
//! WebSocket push channel; when push is unavailable, tasks are polled over
//! REST until they resolve.

pub mod board;
pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod fetch;
pub mod identity;
pub mod listeners;
pub mod poller;
pub mod registry;
pub mod transport;

pub use board::{TaskBoard, TaskSnapshot, UpdateSource};
pub use client::{ClientStats, TaskClient, TaskWatch};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, PushSettings};
pub use fetch::HttpStatusSource;
pub use identity::ClientIdentity;
pub use listeners::ObserverHandle;
pub use poller::{poll_until_terminal, spawn_poll, PollHandle, PollOptions, StatusSource, TaskOutcome};
pub use registry::SubscriptionRegistry;
pub use transport::{Connector, WsConnector};
