//! Desired-state manifests.
//!
//! A manifest lists independent policies. Applying it converges each entry
//! concurrently and reports one outcome per entry; a failing entry does not
//! stop the others.

use std::path::{Path, PathBuf};

use fleetsync_core::{CreateResponse, OpContext, ReadResponse};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{PolicySpec, PolicyState};
use crate::resources::Resource;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest entry {index} ({name:?}) is invalid: {reason}")]
    Invalid {
        index: usize,
        name: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

impl Manifest {
    /// Read and validate a JSON manifest.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Self =
            serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        for (index, spec) in self.policies.iter().enumerate() {
            spec.validate().map_err(|reason| ManifestError::Invalid {
                index,
                name: spec.name.clone(),
                reason,
            })?;
        }
        Ok(())
    }
}

/// What happened to one manifest entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityOutcome {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    pub assignments: usize,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntityOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Converge every manifest entry through `resource`.
///
/// Each entry is created, then refreshed. With `teardown` the entry is
/// deleted again afterwards, including entries whose create failed after the
/// policy was already written remotely.
pub async fn apply_manifest<R>(
    resource: &R,
    ctx: &OpContext,
    manifest: &Manifest,
    teardown: bool,
) -> Vec<EntityOutcome>
where
    R: Resource<Spec = PolicySpec, State = PolicyState>,
{
    info!(
        resource_type = resource.type_name(),
        entries = manifest.policies.len(),
        "applying manifest"
    );
    let runs = manifest
        .policies
        .iter()
        .map(|spec| apply_entry(resource, ctx, spec, teardown));
    join_all(runs).await
}

async fn apply_entry<R>(
    resource: &R,
    ctx: &OpContext,
    spec: &PolicySpec,
    teardown: bool,
) -> EntityOutcome
where
    R: Resource<Spec = PolicySpec, State = PolicyState>,
{
    let mut outcome = EntityOutcome {
        name: spec.name.clone(),
        ..Default::default()
    };

    let mut created = CreateResponse::new();
    let create_result = resource.create(ctx, spec, &mut created).await;
    outcome.warnings = created
        .diagnostics
        .warnings()
        .map(ToString::to_string)
        .collect();
    let mut state = created.state;

    match create_result {
        Ok(()) => {
            if let Some(current) = state.clone() {
                let mut refreshed = ReadResponse::with_state(current);
                match resource.read(ctx, &mut refreshed).await {
                    Ok(()) => state = refreshed.state,
                    Err(e) => outcome.error = Some(e.to_string()),
                }
            }
        }
        Err(e) => {
            warn!("Policy {} did not converge: {}", spec.name, e);
            outcome.error = Some(e.to_string());
        }
    }

    if let Some(current) = &state {
        outcome.policy_id = Some(current.id.clone());
        outcome.assignments = current.assignments.len();
    }

    if let Some(current) = state.as_ref().filter(|_| teardown) {
        match resource.delete(ctx, current).await {
            Ok(_) => outcome.deleted = true,
            Err(e) => {
                let message = e.to_string();
                outcome.error = Some(match outcome.error.take() {
                    Some(previous) => format!("{previous}; teardown: {message}"),
                    None => format!("teardown: {message}"),
                });
            }
        }
    }

    outcome
}
