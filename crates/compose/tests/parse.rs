use std::time::Duration;

use skiff_compose::{load_str, ComposeError};
use skiff_core::{DependsOnCondition, Protocol};

const FULL: &str = r#"
services:
  db:
    image: postgres:15
    environment:
      POSTGRES_PASSWORD: hunter2
      POSTGRES_DB: app
      EMPTY:
      PORT: 5432
    ports:
      - "5432:5432"
    healthcheck:
      test: ["CMD", "pg_isready"]
      interval: 5s
      timeout: 2s
      retries: 10
  api:
    image: example.com/team/api:1.2
    entrypoint: ["/bin/api", "--serve"]
    working_dir: /srv
    environment:
      - DATABASE_URL=postgres://db/app
      - DEBUG
    ports:
      - 8080
      - "9090/udp"
    depends_on:
      db:
        condition: service_healthy
  worker:
    image: example.com/team/worker:1.2
    depends_on:
      - api
"#;

#[test]
fn full_composition_canonicalizes() {
    let composition = load_str(FULL).unwrap();
    assert_eq!(composition.services.len(), 3);

    let db = &composition.services["db"];
    assert_eq!(db.image, "postgres:15");
    assert_eq!(db.environment["POSTGRES_PASSWORD"], "hunter2");
    assert_eq!(db.environment["EMPTY"], "");
    assert_eq!(db.environment["PORT"], "5432");
    assert_eq!(db.ports.len(), 1);
    assert_eq!(db.ports[0].container_port, 5432);
    assert_eq!(db.ports[0].protocol, Protocol::Tcp);
    let hc = db.healthcheck.as_ref().unwrap();
    assert_eq!(hc.test, vec!["CMD".to_string(), "pg_isready".to_string()]);
    assert_eq!(hc.interval, Duration::from_secs(5));
    assert_eq!(hc.timeout, Duration::from_secs(2));
    assert_eq!(hc.retries, 10);

    let api = &composition.services["api"];
    assert_eq!(api.entrypoint, vec!["/bin/api", "--serve"]);
    assert_eq!(api.working_dir.as_deref(), Some("/srv"));
    assert_eq!(api.environment["DATABASE_URL"], "postgres://db/app");
    assert_eq!(api.environment["DEBUG"], "");
    assert_eq!(api.ports[0].container_port, 8080);
    assert_eq!(api.ports[1].protocol, Protocol::Udp);
    assert_eq!(api.depends_on["db"], DependsOnCondition::Healthy);

    let worker = &composition.services["worker"];
    assert_eq!(worker.depends_on["api"], DependsOnCondition::Started);
    assert!(worker.healthcheck.is_none());
    assert!(!worker.healthcheck_disabled);
}

#[test]
fn string_healthcheck_becomes_cmd_shell() {
    let composition = load_str(
        r#"
services:
  web:
    image: nginx:1.25
    healthcheck:
      test: curl -f http://localhost/
"#,
    )
    .unwrap();
    let hc = composition.services["web"].healthcheck.as_ref().unwrap();
    assert_eq!(hc.test[0], "CMD-SHELL");
    assert_eq!(hc.test[1], "curl -f http://localhost/");
}

#[test]
fn disabled_healthcheck_sets_flag() {
    let composition = load_str(
        r#"
services:
  web:
    image: nginx:1.25
    healthcheck:
      disable: true
      test: ["CMD", "true"]
"#,
    )
    .unwrap();
    let web = &composition.services["web"];
    assert!(web.healthcheck.is_none());
    assert!(web.healthcheck_disabled);
}

#[test]
fn none_test_means_no_healthcheck() {
    let composition = load_str(
        r#"
services:
  web:
    image: nginx:1.25
    healthcheck:
      test: ["NONE"]
"#,
    )
    .unwrap();
    let web = &composition.services["web"];
    assert!(web.healthcheck.is_none());
    assert!(!web.healthcheck_disabled);
}

#[test]
fn unknown_condition_is_rejected() {
    let err = load_str(
        r#"
services:
  a:
    image: x
  b:
    image: y
    depends_on:
      a:
        condition: service_completed_successfully
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ComposeError::Invalid { .. }));
    assert!(err.to_string().contains("unsupported condition"));
}

#[test]
fn dependency_on_unknown_service_is_rejected() {
    let err = load_str(
        r#"
services:
  b:
    image: y
    depends_on:
      - ghost
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("unknown service ghost"));
}

#[test]
fn missing_image_is_empty_not_error() {
    // The engine rejects empty images at resolve time with its own message.
    let composition = load_str("services:\n  a: {}\n").unwrap();
    assert_eq!(composition.services["a"].image, "");
}
