//! Tests for the compose transformer.

use super::transform::skey;
use super::*;
use serde_yaml::Value;

fn routing() -> RoutingConfig {
    RoutingConfig {
        internal_domain: "internal.example".to_string(),
        external_domain: Some("example.com".to_string()),
        load_balancer_network: Some("load-balancer".to_string()),
    }
}

fn section<'a>(result: &'a Transformed, name: &str) -> &'a serde_yaml::Mapping {
    result.document.get(&skey(name)).and_then(Value::as_mapping).unwrap()
}

fn service<'a>(result: &'a Transformed, name: &str) -> &'a serde_yaml::Mapping {
    section(result, "services").get(&skey(name)).and_then(Value::as_mapping).unwrap()
}

fn field<'a>(mapping: &'a serde_yaml::Mapping, key: &str) -> &'a Value {
    mapping.get(&skey(key)).unwrap()
}

fn scalar<'a>(mapping: &'a serde_yaml::Mapping, key: &str) -> &'a str {
    mapping.get(&skey(key)).and_then(Value::as_str).unwrap()
}

#[test]
fn test_defaults_applied() {
    let yaml = r#"
services:
  web:
    image: nginx:latest
"#;
    let result = transform(yaml, &routing()).unwrap();
    let web = service(&result, "web");
    assert_eq!(scalar(web, "container_name"), "web");
    assert_eq!(scalar(web, "restart"), "unless-stopped");
    assert_eq!(scalar(web, "cpus"), "0.2");
    assert_eq!(scalar(web, "mem_limit"), "128m");
    assert_eq!(scalar(web, "memswap_limit"), "0");
}

#[test]
fn test_explicit_values_kept() {
    let yaml = r#"
services:
  db:
    image: postgres:16
    container_name: primary-db
    restart: "no"
    mem_limit: 2g
"#;
    let result = transform(yaml, &routing()).unwrap();
    let db = service(&result, "db");
    assert_eq!(scalar(db, "container_name"), "primary-db");
    assert_eq!(scalar(db, "restart"), "no");
    assert_eq!(scalar(db, "mem_limit"), "2g");
}

#[test]
fn test_network_references_declared_external() {
    let yaml = r#"
services:
  a:
    image: x
    networks: [backend]
  b:
    image: y
    networks: [backend, frontend]
"#;
    let result = transform(yaml, &routing()).unwrap();
    assert_eq!(result.networks, vec!["backend".to_string(), "frontend".to_string()]);

    let networks = section(&result, "networks");
    assert_eq!(networks.len(), 2);
    let backend = field(networks, "backend").as_mapping().unwrap();
    assert_eq!(scalar(backend, "name"), "backend");
    assert_eq!(scalar(backend, "driver"), "external");
}

#[test]
fn test_volume_mount_suffix_stripped() {
    let yaml = r#"
services:
  db:
    image: postgres:16
    volumes:
      - data:/var/lib/postgresql/data:ro
      - cache
"#;
    let result = transform(yaml, &routing()).unwrap();
    assert_eq!(result.volumes, vec!["data".to_string(), "cache".to_string()]);

    let volumes = section(&result, "volumes");
    let data = field(volumes, "data").as_mapping().unwrap();
    assert_eq!(field(data, "external"), &Value::Bool(true));
    // The service's own mount string is untouched.
    let mounts = field(service(&result, "db"), "volumes").as_sequence().unwrap();
    assert_eq!(mounts[0].as_str().unwrap(), "data:/var/lib/postgresql/data:ro");
}

#[test]
fn test_secret_reference_injects_environment() {
    let yaml = r#"
services:
  app:
    image: myapp:latest
    secrets: [DB_PASSWORD]
"#;
    let result = transform(yaml, &routing()).unwrap();
    assert_eq!(result.secrets, vec!["DB_PASSWORD".to_string()]);

    let env = field(service(&result, "app"), "environment").as_mapping().unwrap();
    assert_eq!(scalar(env, "DB_PASSWORD"), "/run/secrets/DB_PASSWORD");

    let secrets = section(&result, "secrets");
    let entry = field(secrets, "DB_PASSWORD").as_mapping().unwrap();
    assert_eq!(scalar(entry, "environment"), "DB_PASSWORD");
}

#[test]
fn test_secret_env_injection_respects_existing_entries() {
    let yaml = r#"
services:
  app:
    image: myapp:latest
    secrets: [TOKEN]
    environment:
      - TOKEN=custom
      - MODE=prod
"#;
    let result = transform(yaml, &routing()).unwrap();
    let env = field(service(&result, "app"), "environment").as_sequence().unwrap();
    assert_eq!(env.len(), 2);
    assert_eq!(env[0].as_str().unwrap(), "TOKEN=custom");
}

#[test]
fn test_routing_labels_synthesized() {
    let yaml = r#"
services:
  web:
    image: nginx:latest
    labels:
      http.port: "80"
      app.tier: edge
"#;
    let result = transform(yaml, &routing()).unwrap();
    let labels = field(service(&result, "web"), "labels").as_mapping().unwrap();

    assert!(!labels.contains_key(&skey("http.port")));
    assert_eq!(scalar(labels, "app.tier"), "edge");
    assert_eq!(scalar(labels, "traefik.enable"), "true");
    assert_eq!(
        scalar(labels, "traefik.http.routers.web.rule"),
        "Host(`web.example.com`) || Host(`web.internal.example`)"
    );
    assert_eq!(result.networks, vec!["load-balancer".to_string()]);
}

#[test]
fn test_routing_without_external_domain() {
    let yaml = r#"
services:
  web:
    image: nginx:latest
    labels: ["http.port=80"]
"#;
    let config = RoutingConfig {
        internal_domain: "localhost".to_string(),
        external_domain: None,
        load_balancer_network: None,
    };
    let result = transform(yaml, &config).unwrap();
    let labels = field(service(&result, "web"), "labels").as_mapping().unwrap();
    assert_eq!(
        scalar(labels, "traefik.http.routers.web.rule"),
        "Host(`web.localhost`)"
    );
    assert!(result.networks.is_empty());
}

#[test]
fn test_service_without_http_port_label_unaffected() {
    let yaml = r#"
services:
  worker:
    image: worker:latest
    labels:
      app.tier: batch
"#;
    let result = transform(yaml, &routing()).unwrap();
    let labels = field(service(&result, "worker"), "labels").as_mapping().unwrap();
    assert!(!labels.contains_key(&skey("traefik.enable")));
    assert!(result.networks.is_empty());
}

#[test]
fn test_explicit_routing_labels_not_overwritten() {
    let yaml = r#"
services:
  web:
    image: nginx:latest
    labels:
      http.port: "80"
      traefik.enable: "false"
      traefik.http.routers.web.rule: Host(`custom.example`)
"#;
    let result = transform(yaml, &routing()).unwrap();
    let labels = field(service(&result, "web"), "labels").as_mapping().unwrap();
    assert_eq!(scalar(labels, "traefik.enable"), "false");
    assert_eq!(scalar(labels, "traefik.http.routers.web.rule"), "Host(`custom.example`)");
}

#[test]
fn test_object_form_references_rejected() {
    let yaml = r#"
services:
  app:
    image: x
    networks:
      backend:
        aliases: [app]
"#;
    let err = transform(yaml, &routing()).unwrap_err();
    match err {
        crate::error::StackdError::UnsupportedDeclaration { service, field } => {
            assert_eq!(service, "app");
            assert_eq!(field, "networks");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_invalid_documents_rejected() {
    assert!(parse("").is_err());
    assert!(parse("- just\n- a\n- list\n").is_err());
    assert!(transform("networks: {}\n", &routing()).is_err());
    assert!(transform("services: [a, b]\n", &routing()).is_err());
    assert!(transform("services:\n  app: [not, a, mapping]\n", &routing()).is_err());
}

#[test]
fn test_existing_section_entries_preserved() {
    let yaml = r#"
services:
  app:
    image: x
    networks: [backend]
networks:
  backend:
    name: custom-backend
"#;
    let result = transform(yaml, &routing()).unwrap();
    let networks = section(&result, "networks");
    let backend = field(networks, "backend").as_mapping().unwrap();
    assert_eq!(scalar(backend, "name"), "custom-backend");
    assert_eq!(scalar(backend, "driver"), "external");
}

#[test]
fn test_round_trip_is_stable() {
    let yaml = r#"
services:
  web:
    image: nginx:latest
    networks: [frontend]
    volumes: [assets:/srv/assets]
    secrets: [API_KEY]
"#;
    let first = transform(yaml, &routing()).unwrap();
    let text = to_yaml(&first.document).unwrap();
    let second = transform(&text, &routing()).unwrap();

    assert_eq!(first.document, second.document);
    assert_eq!(first.networks, second.networks);
    assert_eq!(first.volumes, second.volumes);
    assert_eq!(first.secrets, second.secrets);
}
