// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Datadog APM Agent
//!
//! In-process instrumentation core. The agent intercepts package loads on a host
//! [`module::ModuleLoader`], wraps exported functions of instrumented packages through a
//! [`shim::Shim`], tracks the active transaction and segment across synchronous and
//! asynchronous continuations ([`context`], [`scheduler`]) and buffers finished telemetry in
//! [`aggregators`] until a [`harvester::Harvester`] ships it.
//!
//! ## Architecture
//!
//! - [`agent`]: process-wide state and the loader interceptor
//! - [`shimmer`]: registrations and once-per-module-copy instrumentation
//! - [`shim`]: wrapping and recording helpers handed to instrumentation hooks
//! - [`transaction`]: transactions and their segment trees
//! - [`api`]: tracing API for application code
//! - [`instrumentation`]: built-in registrations

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod agent;
pub mod aggregators;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod harvester;
pub mod instrumentation;
pub mod llm;
pub mod logger;
pub mod module;
pub mod names;
pub mod scheduler;
pub mod shim;
pub mod shimmer;
pub mod transaction;

pub use agent::Agent;
pub use api::Api;
pub use config::AgentConfig;
pub use context::{Context, ContextFutureExt};
pub use shim::{RecordSpec, Shim};
pub use shimmer::InstrumentationRegistration;
pub use transaction::{Segment, Transaction, TransactionKind};
