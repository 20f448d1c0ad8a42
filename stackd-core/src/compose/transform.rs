//! Compose document transformer.
//!
//! Rewrites a parsed compose document in two passes: a read pass that
//! validates shapes and collects per-service requirements, then an apply
//! pass that mutates the document. Keeping collection separate from
//! mutation means the walk never iterates a mapping it is also editing.
//!
//! The document is handled as a generic `serde_yaml::Mapping` (insertion
//! order preserved) so unknown keys round-trip untouched.

use crate::error::{Result, StackdError};
use serde_yaml::{Mapping, Value};

/// Routing conventions applied to services that opt in via the
/// `http.port` label.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Domain every routed service is reachable under.
    pub internal_domain: String,
    /// Optional public domain; the routing rule matches both when set.
    pub external_domain: Option<String>,
    /// Shared reverse-proxy network joined by routed services.
    pub load_balancer_network: Option<String>,
}

/// A rewritten document plus the shared infrastructure it requires.
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub document: Mapping,
    /// Network names referenced by at least one service, first-reference
    /// order, deduplicated.
    pub networks: Vec<String>,
    /// Volume names (mount suffixes stripped), same ordering rules.
    pub volumes: Vec<String>,
    /// Secret names, same ordering rules.
    pub secrets: Vec<String>,
}

/// Per-service requirements collected by the read pass.
struct ServicePlan {
    name: String,
    networks: Vec<String>,
    volumes: Vec<String>,
    secrets: Vec<String>,
    wants_routing: bool,
}

/// Parse compose text into a top-level mapping.
pub fn parse(text: &str) -> Result<Mapping> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| StackdError::InvalidDocument {
        reason: format!("Not valid YAML: {}", e),
    })?;
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => {
            Err(StackdError::InvalidDocument { reason: "Empty document".to_string() })
        }
        _ => Err(StackdError::InvalidDocument {
            reason: "Top level must be a mapping".to_string(),
        }),
    }
}

/// Serialize a document back to YAML text.
pub fn to_yaml(document: &Mapping) -> Result<String> {
    serde_yaml::to_string(document).map_err(StackdError::internal)
}

/// Rewrite a substituted compose document, returning it together with the
/// accumulated infrastructure requirements.
pub fn transform(text: &str, routing: &RoutingConfig) -> Result<Transformed> {
    let mut document = parse(text)?;

    let plans = collect(&document)?;
    apply(&mut document, &plans, routing)?;

    let mut networks = Vec::new();
    let mut volumes = Vec::new();
    let mut secrets = Vec::new();
    for plan in &plans {
        for network in &plan.networks {
            push_unique(&mut networks, network);
        }
        if plan.wants_routing {
            if let Some(lb) = &routing.load_balancer_network {
                push_unique(&mut networks, lb);
            }
        }
        for volume in &plan.volumes {
            push_unique(&mut volumes, volume);
        }
        for secret in &plan.secrets {
            push_unique(&mut secrets, secret);
        }
    }

    Ok(Transformed { document, networks, volumes, secrets })
}

/// Read pass: validate document shape and gather per-service requirements.
fn collect(document: &Mapping) -> Result<Vec<ServicePlan>> {
    for section in ["networks", "volumes", "secrets"] {
        if let Some(value) = document.get(&skey(section)) {
            if !value.is_mapping() && !value.is_null() {
                return Err(StackdError::InvalidDocument {
                    reason: format!("{} must be a mapping", section),
                });
            }
        }
    }

    let services = match document.get(&skey("services")) {
        Some(Value::Mapping(services)) => services,
        Some(_) => {
            return Err(StackdError::InvalidDocument {
                reason: "services must be a mapping".to_string(),
            })
        }
        None => {
            return Err(StackdError::InvalidDocument {
                reason: "Document must contain a services mapping".to_string(),
            })
        }
    };

    let mut plans = Vec::new();
    for (name, declaration) in services {
        let name = name.as_str().ok_or_else(|| StackdError::InvalidDocument {
            reason: "Service names must be strings".to_string(),
        })?;
        let service = declaration.as_mapping().ok_or_else(|| StackdError::InvalidDocument {
            reason: format!("services.{} must be a mapping", name),
        })?;

        let networks = string_refs(name, service, "networks")?;
        let volumes = string_refs(name, service, "volumes")?
            .into_iter()
            .map(|reference| strip_mount_suffix(&reference))
            .collect();
        let secrets = string_refs(name, service, "secrets")?;
        let wants_routing = normalized_labels(service).contains_key(&skey("http.port"));

        plans.push(ServicePlan {
            name: name.to_string(),
            networks,
            volumes,
            secrets,
            wants_routing,
        });
    }

    Ok(plans)
}

/// Apply pass: inject defaults, secret environment mappings, routing
/// labels, and external top-level declarations.
fn apply(document: &mut Mapping, plans: &[ServicePlan], routing: &RoutingConfig) -> Result<()> {
    for plan in plans {
        {
            let service = service_mut(document, &plan.name)?;

            insert_if_absent(service, "container_name", skey(&plan.name));
            insert_if_absent(service, "restart", skey("unless-stopped"));
            insert_if_absent(service, "cpus", skey("0.2"));
            insert_if_absent(service, "mem_limit", skey("128m"));
            insert_if_absent(service, "memswap_limit", skey("0"));

            for secret in &plan.secrets {
                inject_secret_env(service, secret);
            }

            if plan.wants_routing {
                let mut labels = normalized_labels(service);
                labels.remove(&skey("http.port"));
                insert_if_absent(&mut labels, "traefik.enable", skey("true"));
                let rule = match &routing.external_domain {
                    Some(external) => format!(
                        "Host(`{0}.{1}`) || Host(`{0}.{2}`)",
                        plan.name, external, routing.internal_domain
                    ),
                    None => format!("Host(`{}.{}`)", plan.name, routing.internal_domain),
                };
                insert_if_absent(
                    &mut labels,
                    &format!("traefik.http.routers.{}.rule", plan.name),
                    skey(&rule),
                );
                service.insert(skey("labels"), Value::Mapping(labels));
            }
        }

        for network in &plan.networks {
            declare_network(document, network)?;
        }
        if plan.wants_routing {
            if let Some(lb) = &routing.load_balancer_network {
                declare_network(document, lb)?;
            }
        }
        for volume in &plan.volumes {
            declare_volume(document, volume)?;
        }
        for secret in &plan.secrets {
            declare_secret(document, secret)?;
        }
    }

    Ok(())
}

fn service_mut<'a>(document: &'a mut Mapping, name: &str) -> Result<&'a mut Mapping> {
    document
        .get_mut(&skey("services"))
        .and_then(Value::as_mapping_mut)
        .and_then(|services| services.get_mut(&skey(name)))
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| StackdError::InvalidDocument {
            reason: format!("services.{} must be a mapping", name),
        })
}

/// Read a `networks`/`volumes`/`secrets` reference list. Only the simple
/// list-of-strings form is supported; object-form references are rejected
/// rather than silently ignored.
fn string_refs(service: &str, declaration: &Mapping, field: &str) -> Result<Vec<String>> {
    let Some(value) = declaration.get(&skey(field)) else {
        return Ok(Vec::new());
    };
    let items = value.as_sequence().ok_or_else(|| unsupported(service, field))?;

    let mut refs = Vec::new();
    for item in items {
        let reference = item.as_str().ok_or_else(|| unsupported(service, field))?;
        refs.push(reference.to_string());
    }
    Ok(refs)
}

/// Volume references may carry a `:`-delimited mount suffix
/// (`data:/var/lib/data:ro`); only the leading name resolves the volume.
fn strip_mount_suffix(reference: &str) -> String {
    match reference.split_once(':') {
        Some((name, _)) => name.to_string(),
        None => reference.to_string(),
    }
}

/// Labels appear either as a mapping or as a list of `KEY=VALUE`/`KEY`
/// strings; normalize to a mapping before inspection.
fn normalized_labels(declaration: &Mapping) -> Mapping {
    match declaration.get(&skey("labels")) {
        Some(Value::Mapping(labels)) => labels.clone(),
        Some(Value::Sequence(items)) => {
            let mut labels = Mapping::new();
            for item in items {
                if let Some(entry) = item.as_str() {
                    match entry.split_once('=') {
                        Some((key, value)) => labels.insert(skey(key), skey(value)),
                        None => labels.insert(skey(entry), skey("")),
                    };
                }
            }
            labels
        }
        _ => Mapping::new(),
    }
}

/// Make a secret available to the service as an environment variable
/// pointing at its mounted path.
fn inject_secret_env(service: &mut Mapping, secret: &str) {
    let target = format!("/run/secrets/{}", secret);
    match service.get_mut(&skey("environment")) {
        Some(Value::Mapping(env)) => {
            if !env.contains_key(&skey(secret)) {
                env.insert(skey(secret), skey(&target));
            }
        }
        Some(Value::Sequence(env)) => {
            let prefix = format!("{}=", secret);
            let present = env
                .iter()
                .any(|e| e.as_str().is_some_and(|s| s == secret || s.starts_with(&prefix)));
            if !present {
                env.push(skey(&format!("{}={}", secret, target)));
            }
        }
        _ => {
            let mut env = Mapping::new();
            env.insert(skey(secret), skey(&target));
            service.insert(skey("environment"), Value::Mapping(env));
        }
    }
}

fn declare_network(document: &mut Mapping, name: &str) -> Result<()> {
    let entry = section_entry(document, "networks", name)?;
    insert_if_absent(entry, "name", skey(name));
    entry.insert(skey("driver"), skey("external"));
    Ok(())
}

fn declare_volume(document: &mut Mapping, name: &str) -> Result<()> {
    let entry = section_entry(document, "volumes", name)?;
    insert_if_absent(entry, "external", Value::Bool(true));
    Ok(())
}

fn declare_secret(document: &mut Mapping, name: &str) -> Result<()> {
    let entry = section_entry(document, "secrets", name)?;
    insert_if_absent(entry, "environment", skey(name));
    Ok(())
}

/// Mutable named entry in a top-level section, creating the section and the
/// entry (and normalizing `null` placeholders to empty mappings) as needed.
fn section_entry<'a>(
    document: &'a mut Mapping,
    section: &str,
    name: &str,
) -> Result<&'a mut Mapping> {
    let slot = document
        .entry(skey(section))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if slot.is_null() {
        *slot = Value::Mapping(Mapping::new());
    }
    let section_map = slot.as_mapping_mut().ok_or_else(|| StackdError::InvalidDocument {
        reason: format!("{} must be a mapping", section),
    })?;

    let entry = section_map
        .entry(skey(name))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if entry.is_null() {
        *entry = Value::Mapping(Mapping::new());
    }
    entry.as_mapping_mut().ok_or_else(|| StackdError::InvalidDocument {
        reason: format!("{}.{} must be a mapping", section, name),
    })
}

fn insert_if_absent(mapping: &mut Mapping, key: &str, value: Value) {
    let key = skey(key);
    if !mapping.contains_key(&key) {
        mapping.insert(key, value);
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn unsupported(service: &str, field: &str) -> StackdError {
    StackdError::UnsupportedDeclaration { service: service.to_string(), field: field.to_string() }
}

pub(crate) fn skey(s: &str) -> Value {
    Value::String(s.to_string())
}
