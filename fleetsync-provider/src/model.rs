//! Device configuration policy model.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use fleetsync_core::{Identified, Relationship};
use serde::{Deserialize, Serialize};

/// Who an assignment applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssignmentTarget {
    AllDevices,
    AllUsers,
    IncludeGroup { group_id: String },
    ExcludeGroup { group_id: String },
}

impl AssignmentTarget {
    pub fn is_exclusion(&self) -> bool {
        matches!(self, Self::ExcludeGroup { .. })
    }
}

impl fmt::Display for AssignmentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllDevices => f.write_str("all_devices"),
            Self::AllUsers => f.write_str("all_users"),
            Self::IncludeGroup { group_id } => write!(f, "include_group:{group_id}"),
            Self::ExcludeGroup { group_id } => write!(f, "exclude_group:{group_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    Include,
    Exclude,
}

/// Device filter narrowing an inclusion assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentFilter {
    pub filter_id: String,
    pub mode: FilterMode,
}

/// One policy assignment. The server assigns `id` on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub target: AssignmentTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<AssignmentFilter>,
}

impl Assignment {
    pub fn new(target: AssignmentTarget) -> Self {
        Self {
            id: None,
            target,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter_id: impl Into<String>, mode: FilterMode) -> Self {
        self.filter = Some(AssignmentFilter {
            filter_id: filter_id.into(),
            mode,
        });
        self
    }
}

impl Identified for Assignment {
    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

impl Relationship for Assignment {
    type Key = AssignmentTarget;

    fn key(&self) -> AssignmentTarget {
        self.target.clone()
    }

    fn same_payload(&self, other: &Self) -> bool {
        self.target == other.target && self.filter == other.filter
    }
}

/// Request body for policy create and update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyPayload {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub platform: String,
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

/// A policy as the remote API returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    #[serde(flatten)]
    pub payload: PolicyPayload,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

/// Declared desired state of one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub settings: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
}

fn default_platform() -> String {
    "windows10".to_string()
}

impl PolicySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            platform: default_platform(),
            settings: BTreeMap::new(),
            assignments: Vec::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn with_assignment(mut self, assignment: Assignment) -> Self {
        self.assignments.push(assignment);
        self
    }

    pub fn payload(&self) -> PolicyPayload {
        PolicyPayload {
            name: self.name.clone(),
            description: self.description.clone(),
            platform: self.platform.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Problems the remote API would reject anyway.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("policy name must not be empty".to_string());
        }
        if self.platform.trim().is_empty() {
            return Err(format!("policy {}: platform must not be empty", self.name));
        }
        for a in &self.assignments {
            if a.target.is_exclusion() && a.filter.is_some() {
                return Err(format!(
                    "policy {}: exclusion assignment {} cannot carry a filter",
                    self.name, a.target
                ));
            }
            let group_id = match &a.target {
                AssignmentTarget::IncludeGroup { group_id }
                | AssignmentTarget::ExcludeGroup { group_id } => Some(group_id),
                AssignmentTarget::AllDevices | AssignmentTarget::AllUsers => None,
            };
            if group_id.is_some_and(|g| g.trim().is_empty()) {
                return Err(format!("policy {}: assignment with empty group id", self.name));
            }
        }
        Ok(())
    }
}

/// Converged state of one policy, as recorded after an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyState {
    pub id: String,
    pub name: String,
    pub description: String,
    pub platform: String,
    pub settings: BTreeMap<String, serde_json::Value>,
    pub assignments: Vec<Assignment>,
    pub version: u64,
    pub last_modified_at: DateTime<Utc>,
}

impl PolicyState {
    pub fn from_remote(policy: Policy, assignments: Vec<Assignment>) -> Self {
        Self {
            id: policy.id,
            name: policy.payload.name,
            description: policy.payload.description,
            platform: policy.payload.platform,
            settings: policy.payload.settings,
            assignments,
            version: policy.version,
            last_modified_at: policy.last_modified_at,
        }
    }

    /// Whether the remote side matches `spec`, assignments included.
    pub fn matches(&self, spec: &PolicySpec) -> bool {
        self.name == spec.name
            && self.description == spec.description
            && self.platform == spec.platform
            && self.settings == spec.settings
            && fleetsync_core::diff_relationships(
                spec.assignments.clone(),
                self.assignments.clone(),
            )
            .is_empty()
    }
}
