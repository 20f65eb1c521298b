//! Mesos cluster-state tracker.
//!
//! Subscribes to a Mesos master's Operator API event stream, maintains an
//! in-memory model of the cluster's agents, frameworks, and tasks, and
//! republishes task-level changes to in-process subscribers. Subscribers
//! attach through a [`client::TrackerHandle`] and receive a point-in-time
//! snapshot followed by live deltas.

pub mod client;
pub mod config;
pub mod connection;
pub mod data_model;
pub mod metrics;
pub mod operator_api;
pub mod recordio;
pub mod service;
pub mod telemetry;
pub mod tracker;

pub use client::{Subscription, TrackerHandle};
pub use tracker::subscribers::{SubscribeError, SubscriberId};

#[cfg(test)]
mod integration_test;
#[cfg(test)]
mod testing;
