//! Stack inventory.
//!
//! Queries the container runtime for the running container set and groups
//! it into stacks by compose-project label. Everything here is transient;
//! the runtime is the source of truth and each query rebuilds the view.

use crate::error::Result;
use crate::exec::{Invocation, Runner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Label the compose tool stamps on every container it manages.
const PROJECT_LABEL: &str = "com.docker.compose.project";

/// One entry from the runtime's container listing. Field names follow the
/// runtime's own JSON output; every field may be absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "PascalCase")]
pub struct Container {
    #[serde(rename = "ID")]
    pub id: String,
    pub names: String,
    pub image: String,
    pub command: String,
    pub created_at: String,
    pub state: String,
    pub status: String,
    pub ports: String,
    pub networks: String,
    /// Comma-separated `key=value` list as emitted by the runtime.
    pub labels: String,
}

impl Container {
    /// Compose project this container belongs to, if any.
    pub fn project(&self) -> Option<&str> {
        self.labels
            .split(',')
            .filter_map(|label| label.split_once('='))
            .find(|(key, _)| *key == PROJECT_LABEL)
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
    }
}

/// A named stack and the containers sharing its project label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackSummary {
    pub name: String,
    pub containers: Vec<Container>,
}

/// Lists stacks by querying the runtime's container listing.
pub struct StackInventory {
    runner: Arc<dyn Runner>,
    runtime_bin: String,
}

impl StackInventory {
    pub fn new(runner: Arc<dyn Runner>, runtime_bin: impl Into<String>) -> Self {
        Self { runner, runtime_bin: runtime_bin.into() }
    }

    /// All stacks currently known to the runtime, in first-seen project
    /// order. Containers without a project label are skipped.
    pub async fn list_stacks(&self) -> Result<Vec<StackSummary>> {
        let invocation = Invocation::new([
            self.runtime_bin.as_str(),
            "ps",
            "-a",
            "--format",
            "{{json .}}",
        ]);
        let output = self.runner.capture(invocation).await?;

        let mut containers = Vec::new();
        for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match serde_json::from_str::<Container>(line) {
                Ok(container) => containers.push(container),
                // One malformed line must not hide the rest of the listing.
                Err(e) => warn!(error = %e, "Skipping unparseable container entry"),
            }
        }

        let summaries = group_by_project(containers);
        debug!(stacks = summaries.len(), "Listed stacks");
        Ok(summaries)
    }
}

/// Group containers by project label, preserving first-seen order.
fn group_by_project(containers: Vec<Container>) -> Vec<StackSummary> {
    let mut summaries: Vec<StackSummary> = Vec::new();
    for container in containers {
        let Some(project) = container.project().map(String::from) else {
            continue;
        };
        match summaries.iter_mut().find(|s| s.name == project) {
            Some(summary) => summary.containers.push(container),
            None => summaries.push(StackSummary { name: project, containers: vec![container] }),
        }
    }
    summaries
}
