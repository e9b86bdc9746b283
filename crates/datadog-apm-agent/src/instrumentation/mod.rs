// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in instrumentation registered by [`crate::agent::Agent::init`].

use crate::shimmer::InstrumentationRegistration;

pub mod openai;

/// Modules whose usage is tracked without wrapping anything.
pub const TRACKED_MODULES: &[&str] = &["knex"];

pub fn builtin() -> Vec<InstrumentationRegistration> {
    let mut registrations = vec![openai::registration()];
    registrations.extend(
        TRACKED_MODULES
            .iter()
            .copied()
            .map(InstrumentationRegistration::new),
    );
    registrations
}
