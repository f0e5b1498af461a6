//! Deployment ordering.
//!
//! Workloads are requested as `NAME` or `NAME/PRIORITY` tokens. Equal
//! priorities deploy together in one group, lower priorities deploy first,
//! and every workload without a priority lands in a trailing group that
//! always deploys last. Resolution is pure: it never touches the store, the
//! workspace, or the Docker daemon.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use thiserror::Error;

/// Separator between the workload name and its priority in a reference token.
pub const PRIORITY_SEPARATOR: char = '/';

/// Errors produced while parsing workload references or assembling a plan.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    /// The token was not `NAME` or `NAME/PRIORITY` with an integer priority.
    #[error(
        "invalid workload reference {token:?}: expected NAME or NAME/PRIORITY \
         where PRIORITY is a non-negative integer"
    )]
    MalformedReference { token: String },

    /// One name was requested twice with two different explicit priorities.
    #[error("workload {name} was requested with conflicting priorities {first} and {second}")]
    ConflictingPriorities { name: String, first: u32, second: u32 },
}

/// A requested workload, optionally pinned to a deployment priority.
///
/// `priority: None` means the workload deploys in the trailing unprioritized
/// group, after every explicitly prioritized one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadReference {
    pub name: String,
    pub priority: Option<u32>,
}

impl WorkloadReference {
    /// A reference without a priority.
    pub fn unprioritized(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: None,
        }
    }

    /// Parse a single `NAME` or `NAME/PRIORITY` token.
    pub fn parse(token: &str) -> Result<Self, PlanError> {
        let malformed = || PlanError::MalformedReference {
            token: token.to_string(),
        };

        let mut parts = token.split(PRIORITY_SEPARATOR);
        let name = parts.next().unwrap_or_default();
        let raw_priority = parts.next();
        if name.is_empty() || parts.next().is_some() {
            return Err(malformed());
        }

        let priority = match raw_priority {
            None => None,
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| malformed())?),
        };

        Ok(Self {
            name: name.to_string(),
            priority,
        })
    }

    /// Parse every token, failing on the first malformed one.
    pub fn parse_all(tokens: &[String]) -> Result<Vec<Self>, PlanError> {
        tokens.iter().map(|token| Self::parse(token)).collect()
    }
}

/// Workload names sharing one priority value, deployed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentGroup {
    /// `None` marks the trailing unprioritized group.
    pub priority: Option<u32>,
    /// Member names, sorted for stable output.
    pub names: Vec<String>,
}

/// An ordered sequence of deployment groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentPlan {
    pub groups: Vec<DeploymentGroup>,
}

impl DeploymentPlan {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total number of workloads across all groups.
    pub fn workload_count(&self) -> usize {
        self.groups.iter().map(|group| group.names.len()).sum()
    }

    /// Every workload name, in deployment order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .flat_map(|group| group.names.iter().map(String::as_str))
    }
}

/// Resolve requested references into an ordered deployment plan.
///
/// Duplicate names collapse to one entry: the first occurrence decides the
/// priority, an explicit priority beats a missing one, and two different
/// explicit priorities for the same name are an input error.
///
/// With `deploy_all`, every workload from `all_workloads` not already
/// referenced joins the trailing unprioritized group. Unless
/// `include_uninitialized`, that sweep is restricted to names present in
/// `initialized_workloads`; explicitly referenced names are never filtered.
pub fn resolve(
    references: &[WorkloadReference],
    deploy_all: bool,
    all_workloads: &[String],
    initialized_workloads: &[String],
    include_uninitialized: bool,
) -> Result<DeploymentPlan, PlanError> {
    let mut priority_of: HashMap<&str, Option<u32>> = HashMap::new();
    for reference in references {
        match priority_of.get(reference.name.as_str()) {
            None => {
                priority_of.insert(&reference.name, reference.priority);
            }
            Some(&known) => match (known, reference.priority) {
                (Some(first), Some(second)) if first != second => {
                    return Err(PlanError::ConflictingPriorities {
                        name: reference.name.clone(),
                        first,
                        second,
                    });
                }
                // An explicit priority wins over a bare repeat of the name.
                (None, Some(priority)) => {
                    priority_of.insert(&reference.name, Some(priority));
                }
                _ => {}
            },
        }
    }

    let mut members: HashMap<Option<u32>, Vec<String>> = HashMap::new();
    for (name, priority) in &priority_of {
        members
            .entry(*priority)
            .or_default()
            .push((*name).to_string());
    }

    if deploy_all {
        let initialized: HashSet<&str> =
            initialized_workloads.iter().map(String::as_str).collect();
        let mut seen: HashSet<&str> = HashSet::new();
        let swept: Vec<String> = all_workloads
            .iter()
            .filter(|name| !priority_of.contains_key(name.as_str()))
            .filter(|name| include_uninitialized || initialized.contains(name.as_str()))
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect();
        if !swept.is_empty() {
            members.entry(None).or_default().extend(swept);
        }
    }

    // Min-heap over the explicit priorities yields ascending group order; the
    // unprioritized bucket is appended afterwards, never heap-ordered.
    let mut heap: BinaryHeap<Reverse<u32>> = members
        .keys()
        .filter_map(|priority| *priority)
        .map(Reverse)
        .collect();

    let mut plan = DeploymentPlan::default();
    while let Some(Reverse(priority)) = heap.pop() {
        let mut names = members.remove(&Some(priority)).unwrap_or_default();
        names.sort();
        plan.groups.push(DeploymentGroup {
            priority: Some(priority),
            names,
        });
    }
    if let Some(mut names) = members.remove(&None) {
        names.sort();
        plan.groups.push(DeploymentGroup {
            priority: None,
            names,
        });
    }

    Ok(plan)
}
