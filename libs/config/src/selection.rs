//! Route-set selection by environment and machine name
//!
//! Four predicates are tried in order, each over the whole list, and the
//! first set that satisfies one wins:
//!
//! 1. environment and machine both match
//! 2. environment matches, machine is a wildcard
//! 3. machine matches, environment is a wildcard
//! 4. both are wildcards
//!
//! `None`, `""` and `"*"` are wildcards. Comparison ignores ASCII case.

use crate::routes::{ClientRouteSet, ServerRouteSet};
use serde::{Deserialize, Serialize};
use std::env;

pub const ENVIRONMENT_VAR: &str = "SWITCHBOARD_ENVIRONMENT";
pub const MACHINE_NAME_VAR: &str = "HOSTNAME";

/// Where this process runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionContext {
    pub environment: Option<String>,
    pub machine_name: Option<String>,
}

impl SelectionContext {
    pub fn new(environment: Option<&str>, machine_name: Option<&str>) -> Self {
        Self {
            environment: environment.map(str::to_string),
            machine_name: machine_name.map(str::to_string),
        }
    }

    /// Read `SWITCHBOARD_ENVIRONMENT` and `HOSTNAME`
    pub fn from_env() -> Self {
        Self {
            environment: env::var(ENVIRONMENT_VAR).ok(),
            machine_name: env::var(MACHINE_NAME_VAR).ok(),
        }
    }
}

/// Anything carrying environment/machine filters
pub trait Selectable {
    fn environment(&self) -> Option<&str>;
    fn machine_name(&self) -> Option<&str>;
}

impl Selectable for ClientRouteSet {
    fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    fn machine_name(&self) -> Option<&str> {
        self.machine_name.as_deref()
    }
}

impl Selectable for ServerRouteSet {
    fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    fn machine_name(&self) -> Option<&str> {
        self.machine_name.as_deref()
    }
}

fn is_wildcard(value: Option<&str>) -> bool {
    matches!(value.map(str::trim), None | Some("") | Some("*"))
}

fn matches_filter(filter: Option<&str>, actual: Option<&str>) -> bool {
    match (filter, actual) {
        (Some(filter), Some(actual)) if !is_wildcard(Some(filter)) => {
            filter.trim().eq_ignore_ascii_case(actual.trim())
        }
        _ => false,
    }
}

/// Pick the route set that applies to `context`
pub fn select<'a, T: Selectable>(sets: &'a [T], context: &SelectionContext) -> Option<&'a T> {
    let env = context.environment.as_deref();
    let machine = context.machine_name.as_deref();

    let predicates: [&dyn Fn(&T) -> bool; 4] = [
        &|s: &T| matches_filter(s.environment(), env) && matches_filter(s.machine_name(), machine),
        &|s: &T| matches_filter(s.environment(), env) && is_wildcard(s.machine_name()),
        &|s: &T| is_wildcard(s.environment()) && matches_filter(s.machine_name(), machine),
        &|s: &T| is_wildcard(s.environment()) && is_wildcard(s.machine_name()),
    ];

    for predicate in predicates {
        if let Some(found) = sets.iter().find(|s| predicate(*s)) {
            tracing::debug!(
                environment = ?env,
                machine = ?machine,
                selected_environment = ?found.environment(),
                selected_machine = ?found.machine_name(),
                "selected route set"
            );
            return Some(found);
        }
    }

    tracing::warn!(environment = ?env, machine = ?machine, candidates = sets.len(), "no route set matched");
    None
}
