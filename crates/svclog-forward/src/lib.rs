//! Per-target log gathering, client transports, and plan reconciliation.
//!
//! Builds on `svclog-core`'s ring buffer and parser to drive one client per
//! forwarding target (Loki, Syslog, OpenTelemetry), multiplexing however
//! many services that target's selector matches, and reconciling the live
//! set of gatherers and pullers against plan changes from the embedding
//! supervisor.

pub mod client;
pub mod error;
pub mod gatherer;
pub mod manager;
pub mod plan;
pub mod puller;
pub mod puller_group;
pub mod task;

pub use client::Client;
pub use error::ForwardError;
pub use gatherer::{Gatherer, GathererConfig};
pub use manager::{GathererFactory, Manager};
pub use plan::{resolve_label_template, resolve_labels, BufferId, PlanView, Selector, ServiceView, TargetKind, TargetView};
pub use puller::{PulledEntry, Puller};
pub use puller_group::PullerGroup;
pub use task::Tomb;
