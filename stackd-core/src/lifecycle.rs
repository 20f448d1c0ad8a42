//! Stack lifecycle orchestration.
//!
//! Convergence is split into a plan phase and an apply phase. Planning
//! performs substitution, transformation, and secret resolution with no
//! runtime side effects, so invalid documents are rejected before anything
//! is spawned or created. Applying reconciles required infrastructure
//! against what already exists, creates the gaps, pipes the rewritten
//! document to the compose tool, and rolls back every resource it created
//! if anything fails.

use crate::compose::{self, RoutingConfig};
use crate::error::{Result, StackdError};
use crate::exec::{Invocation, OutputSink, Runner};
use crate::secrets::SecretStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// External resource kinds managed alongside a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceKind {
    Network,
    Volume,
}

impl ResourceKind {
    fn noun(self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Volume => "volume",
        }
    }

    fn create_driver(self) -> &'static str {
        match self {
            ResourceKind::Network => "bridge",
            ResourceKind::Volume => "local",
        }
    }
}

/// A validated convergence request: the rewritten document plus everything
/// the apply phase needs. Building one has no runtime side effects beyond
/// secret persistence.
#[derive(Debug)]
pub struct UpPlan {
    pub project: String,
    /// Serialized rewritten document, fed to the compose tool on stdin.
    pub document: String,
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
    /// Resolved secret values, exposed to the compose tool as environment
    /// variables. Never logged.
    pub env: HashMap<String, String>,
}

/// A validated teardown request.
#[derive(Debug)]
pub struct DownPlan {
    pub project: String,
    /// Substituted document text; teardown needs no rewriting.
    pub document: String,
}

/// Orchestrates convergence and teardown of compose stacks.
pub struct StackManager {
    runner: Arc<dyn Runner>,
    secrets: Arc<SecretStore>,
    runtime_bin: String,
    compose_command: Vec<String>,
    routing: RoutingConfig,
}

impl StackManager {
    pub fn new(
        runner: Arc<dyn Runner>,
        secrets: Arc<SecretStore>,
        runtime_bin: impl Into<String>,
        compose_command: Vec<String>,
        routing: RoutingConfig,
    ) -> Self {
        Self { runner, secrets, runtime_bin: runtime_bin.into(), compose_command, routing }
    }

    /// Validate and rewrite a document for convergence. Resolves every
    /// referenced variable and secret against the store (creating them on
    /// first reference) but touches no runtime state.
    #[instrument(skip(self, text))]
    pub async fn plan_up(&self, project: &str, text: &str) -> Result<UpPlan> {
        let project = valid_project(project)?;
        let substituted = self.substituted(text).await?;
        let transformed = compose::transform(&substituted, &self.routing)?;

        let mut env = HashMap::new();
        for secret in &transformed.secrets {
            env.insert(secret.clone(), self.secrets.get_or_create(secret).await?);
        }

        let document = compose::to_yaml(&transformed.document)?;
        info!(
            project,
            networks = transformed.networks.len(),
            volumes = transformed.volumes.len(),
            secrets = transformed.secrets.len(),
            "Planned stack convergence"
        );

        Ok(UpPlan {
            project,
            document,
            networks: transformed.networks,
            volumes: transformed.volumes,
            env,
        })
    }

    /// Converge a planned stack: create missing networks and volumes, then
    /// invoke the compose tool with the rewritten document on stdin. Every
    /// resource created here is deleted again if a later step fails; the
    /// original error is what propagates.
    #[instrument(skip(self, plan, sink, cancel), fields(project = %plan.project))]
    pub async fn apply_up(
        &self,
        plan: &UpPlan,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let mut created: Vec<(ResourceKind, String)> = Vec::new();

        let result = self.converge(plan, &sink, &cancel, &mut created).await;
        if let Err(e) = &result {
            warn!(project = %plan.project, error = %e, "Convergence failed, rolling back");
            self.rollback(&created, &sink).await;
        }
        result
    }

    /// Plan then apply in one call.
    pub async fn up(
        &self,
        project: &str,
        text: &str,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let plan = self.plan_up(project, text).await?;
        self.apply_up(&plan, sink, cancel).await
    }

    /// Validate a document for teardown. Only substitution is applied;
    /// teardown needs no defaulting or derivation.
    pub async fn plan_down(&self, project: &str, text: &str) -> Result<DownPlan> {
        let project = valid_project(project)?;
        let document = self.substituted(text).await?;
        Ok(DownPlan { project, document })
    }

    /// Tear down a planned stack. No rollback semantics apply; teardown is
    /// itself the rollback action.
    #[instrument(skip(self, plan, sink, cancel), fields(project = %plan.project))]
    pub async fn apply_down(
        &self,
        plan: &DownPlan,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let invocation = self
            .compose_invocation(&plan.project, "down", &[])
            .with_stdin(plan.document.clone().into_bytes())
            .checked();
        let code = self.runner.run(invocation, sink, cancel).await?;
        info!(project = %plan.project, "Stack torn down");
        Ok(code)
    }

    /// Plan then apply in one call.
    pub async fn down(
        &self,
        project: &str,
        text: &str,
        sink: OutputSink,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let plan = self.plan_down(project, text).await?;
        self.apply_down(&plan, sink, cancel).await
    }

    async fn converge(
        &self,
        plan: &UpPlan,
        sink: &OutputSink,
        cancel: &CancellationToken,
        created: &mut Vec<(ResourceKind, String)>,
    ) -> Result<i32> {
        let existing_networks = self.existing(ResourceKind::Network).await?;
        let existing_volumes = self.existing(ResourceKind::Volume).await?;

        for name in &plan.networks {
            if !existing_networks.contains(name) {
                self.create(ResourceKind::Network, name, sink, cancel, created).await?;
            }
        }
        for name in &plan.volumes {
            if !existing_volumes.contains(name) {
                self.create(ResourceKind::Volume, name, sink, cancel, created).await?;
            }
        }

        let invocation = self
            .compose_invocation(&plan.project, "up", &["-d", "--wait"])
            .with_stdin(plan.document.clone().into_bytes())
            .with_env(plan.env.clone())
            .checked();
        let code = self.runner.run(invocation, sink.clone(), cancel.clone()).await?;
        info!(project = %plan.project, exit_code = code, "Stack converged");
        Ok(code)
    }

    /// Names of existing resources of one kind, via the runtime's
    /// plain-name listing.
    async fn existing(&self, kind: ResourceKind) -> Result<HashSet<String>> {
        let invocation = Invocation::new([
            self.runtime_bin.as_str(),
            kind.noun(),
            "ls",
            "--format",
            "{{.Name}}",
        ]);
        let output = self.runner.capture(invocation).await?;
        Ok(output.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    /// Create one resource. The name is recorded as created before the
    /// command runs, so a create that fails midway is still a rollback
    /// candidate (deletion is idempotent via `rm -f`).
    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        sink: &OutputSink,
        cancel: &CancellationToken,
        created: &mut Vec<(ResourceKind, String)>,
    ) -> Result<()> {
        created.push((kind, name.to_string()));
        info!(kind = kind.noun(), name, "Creating resource");
        let invocation = Invocation::new([
            self.runtime_bin.as_str(),
            kind.noun(),
            "create",
            "--driver",
            kind.create_driver(),
            name,
        ])
        .strict();
        self.runner.run(invocation, sink.clone(), cancel.clone()).await?;
        Ok(())
    }

    /// Best-effort deletion of everything created in this invocation.
    /// Individual failures are logged and swallowed so they never mask the
    /// error that triggered the rollback. Runs under a fresh cancellation
    /// token so a cancelled request still cleans up after itself.
    async fn rollback(&self, created: &[(ResourceKind, String)], sink: &OutputSink) {
        for (kind, name) in created {
            let invocation = Invocation::new([
                self.runtime_bin.as_str(),
                kind.noun(),
                "rm",
                "-f",
                name,
            ])
            .checked();
            match self.runner.run(invocation, sink.clone(), CancellationToken::new()).await {
                Ok(_) => info!(kind = kind.noun(), name, "Rolled back resource"),
                Err(e) => {
                    warn!(kind = kind.noun(), name, error = %e, "Rollback deletion failed")
                }
            }
        }
    }

    async fn substituted(&self, text: &str) -> Result<String> {
        // The scanner is synchronous, so variables are resolved up front
        // against the store and substitution runs over the resulting map.
        let mut values = HashMap::new();
        for name in compose::scan_variables(text) {
            values.insert(name.clone(), self.secrets.get_or_create(&name).await?);
        }
        Ok(compose::substitute(text, |name| values.get(name).cloned()))
    }

    fn compose_invocation(&self, project: &str, verb: &str, extra: &[&str]) -> Invocation {
        let mut command = self.compose_command.clone();
        command.extend(["-p", project, "-f", "-", verb].map(String::from));
        command.extend(extra.iter().map(|a| a.to_string()));
        Invocation::new(command)
    }
}

fn valid_project(project: &str) -> Result<String> {
    let project = project.trim();
    if project.is_empty() {
        return Err(StackdError::InvalidDocument {
            reason: "Project name must not be blank".to_string(),
        });
    }
    Ok(project.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Scripted runner: records every invocation, serves canned listing
    /// output, and fails any command containing a configured substring.
    #[derive(Default)]
    struct MockRunner {
        calls: Mutex<Vec<Invocation>>,
        existing_networks: Vec<String>,
        existing_volumes: Vec<String>,
        fail_matching: Vec<String>,
    }

    impl MockRunner {
        fn joined_calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|i| i.command.join(" ")).collect()
        }

        fn call(&self, substring: &str) -> Option<Invocation> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|i| i.command.join(" ").contains(substring))
                .cloned()
        }
    }

    #[async_trait]
    impl Runner for MockRunner {
        async fn run(
            &self,
            invocation: Invocation,
            sink: OutputSink,
            _cancel: CancellationToken,
        ) -> Result<i32> {
            let joined = invocation.command.join(" ");
            let check = invocation.check;
            self.calls.lock().unwrap().push(invocation);

            if self.fail_matching.iter().any(|pattern| joined.contains(pattern)) {
                // Mirror the real failure policy: a non-zero exit only
                // becomes an error when the invocation is checked.
                if check {
                    return Err(StackdError::CommandFailure {
                        exit_code: 1,
                        stderr: "scripted failure".to_string(),
                    });
                }
                return Ok(1);
            }

            let listing = if joined.contains("network ls") {
                Some(&self.existing_networks)
            } else if joined.contains("volume ls") {
                Some(&self.existing_volumes)
            } else {
                None
            };
            if let Some(names) = listing {
                let _ = sink.send(Bytes::from(names.join("\n"))).await;
            }
            Ok(0)
        }
    }

    fn manager(dir: &tempfile::TempDir, runner: Arc<MockRunner>) -> StackManager {
        let secrets = Arc::new(SecretStore::with_rng(
            dir.path().join("test.env"),
            Box::new(StdRng::seed_from_u64(7)),
        ));
        StackManager::new(
            runner,
            secrets,
            "docker",
            vec!["docker".to_string(), "compose".to_string()],
            RoutingConfig {
                internal_domain: "localhost".to_string(),
                external_domain: None,
                load_balancer_network: None,
            },
        )
    }

    fn sink() -> OutputSink {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        tx
    }

    const DOC: &str = r#"
services:
  app:
    image: myapp:latest
    networks: [backend]
    volumes: [data:/var/lib/data]
    secrets: [DB_PASSWORD]
"#;

    #[tokio::test]
    async fn test_up_creates_missing_resources_and_invokes_compose() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::default());
        let manager = manager(&dir, runner.clone());

        let code =
            manager.up("shop", DOC, sink(), CancellationToken::new()).await.unwrap();
        assert_eq!(code, 0);

        let calls = runner.joined_calls();
        assert!(calls.contains(&"docker network ls --format {{.Name}}".to_string()));
        assert!(calls.contains(&"docker volume ls --format {{.Name}}".to_string()));
        assert!(calls.contains(&"docker network create --driver bridge backend".to_string()));
        assert!(calls.contains(&"docker volume create --driver local data".to_string()));

        let up = runner.call("compose -p shop -f - up -d --wait").unwrap();
        let stdin = String::from_utf8(up.stdin.unwrap()).unwrap();
        assert!(stdin.contains("container_name: app"));
        assert!(stdin.contains("external: true"));
        let secret = up.env.get("DB_PASSWORD").unwrap();
        assert_eq!(secret.len(), 24);
    }

    #[tokio::test]
    async fn test_up_skips_existing_resources() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner {
            existing_networks: vec!["backend".to_string()],
            existing_volumes: vec!["data".to_string()],
            ..Default::default()
        });
        let manager = manager(&dir, runner.clone());

        manager.up("shop", DOC, sink(), CancellationToken::new()).await.unwrap();

        let calls = runner.joined_calls();
        assert!(!calls.iter().any(|c| c.contains("create")));
    }

    #[tokio::test]
    async fn test_compose_failure_rolls_back_created_resources() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner {
            fail_matching: vec!["up -d --wait".to_string()],
            ..Default::default()
        });
        let manager = manager(&dir, runner.clone());

        let err =
            manager.up("shop", DOC, sink(), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StackdError::CommandFailure { exit_code: 1, .. }));

        let calls = runner.joined_calls();
        assert!(calls.contains(&"docker network rm -f backend".to_string()));
        assert!(calls.contains(&"docker volume rm -f data".to_string()));
    }

    #[tokio::test]
    async fn test_pre_existing_resources_survive_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner {
            existing_networks: vec!["backend".to_string()],
            fail_matching: vec!["up -d --wait".to_string()],
            ..Default::default()
        });
        let manager = manager(&dir, runner.clone());

        manager.up("shop", DOC, sink(), CancellationToken::new()).await.unwrap_err();

        let calls = runner.joined_calls();
        assert!(!calls.contains(&"docker network rm -f backend".to_string()));
        assert!(calls.contains(&"docker volume rm -f data".to_string()));
    }

    #[tokio::test]
    async fn test_failed_create_is_itself_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner {
            fail_matching: vec!["volume create".to_string()],
            ..Default::default()
        });
        let manager = manager(&dir, runner.clone());

        manager.up("shop", DOC, sink(), CancellationToken::new()).await.unwrap_err();

        let calls = runner.joined_calls();
        assert!(calls.contains(&"docker network rm -f backend".to_string()));
        assert!(calls.contains(&"docker volume rm -f data".to_string()));
        assert!(!calls.iter().any(|c| c.contains("compose")));
    }

    #[tokio::test]
    async fn test_rollback_checks_deletions_and_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner {
            fail_matching: vec!["up -d --wait".to_string(), "network rm".to_string()],
            ..Default::default()
        });
        let manager = manager(&dir, runner.clone());

        let err =
            manager.up("shop", DOC, sink(), CancellationToken::new()).await.unwrap_err();
        // The convergence error propagates, not the rollback's.
        assert!(matches!(err, StackdError::CommandFailure { .. }));

        // Deletions are checked, so a non-zero rm surfaces internally
        // instead of passing as success, and the remaining resources are
        // still attempted.
        let rm = runner.call("network rm -f backend").unwrap();
        assert!(rm.check);
        let calls = runner.joined_calls();
        assert!(calls.contains(&"docker volume rm -f data".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_document_rejected_before_any_command() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::default());
        let manager = manager(&dir, runner.clone());

        let err = manager
            .plan_up("shop", "- not\n- a\n- mapping\n")
            .await
            .unwrap_err();
        assert!(matches!(err, StackdError::InvalidDocument { .. }));
        assert!(runner.joined_calls().is_empty());

        assert!(manager.plan_up(" ", DOC).await.is_err());
    }

    #[tokio::test]
    async fn test_substitution_resolves_against_secret_store() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::default());
        let manager = manager(&dir, runner.clone());

        let doc = "services:\n  app:\n    image: myapp:${APP_TAG}\n";
        let plan = manager.plan_up("shop", doc).await.unwrap();
        assert!(!plan.document.contains("${APP_TAG}"));

        // The same key resolves to the same persisted value on replan.
        let again = manager.plan_up("shop", doc).await.unwrap();
        assert_eq!(plan.document, again.document);
    }

    #[tokio::test]
    async fn test_down_only_invokes_compose() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::default());
        let manager = manager(&dir, runner.clone());

        let code =
            manager.down("shop", DOC, sink(), CancellationToken::new()).await.unwrap();
        assert_eq!(code, 0);

        let calls = runner.joined_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], "docker compose -p shop -f - down");

        let down = runner.call("down").unwrap();
        let stdin = String::from_utf8(down.stdin.unwrap()).unwrap();
        // Teardown feeds the substituted document without rewriting it.
        assert!(!stdin.contains("container_name"));
    }
}
