//! Configuration loading and the role policy built from it.

use std::io::Write;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

use hitl_gateway::Error;
use hitl_gateway::config::{Config, ConfirmationBackend};
use hitl_gateway::identity::Principal;
use hitl_gateway::policy::{AccessLevel, Decision, RolePolicyEngine};

const GATEWAY_YAML: &str = r#"
server:
  port: 40100
identity:
  issuer: https://idp.example.com/realms/corp
  audience: gateway
  client_id: gateway
confirmation:
  ttl: 2m
  backend: memory
defense:
  strict: true
  delimiter_ttl: 15m
  system_prompt_signatures:
    - "You are the corporate assistant"
roles:
  superuser_roles: [executive]
  automation_subjects: [qa-bot]
  production: true
  domains:
    payroll:
      read_roles: [payroll-read]
      write_roles: [payroll-write]
    handbook:
      public: true
domains:
  payroll:
    service_key_prefix: payroll
    base_url: http://payroll.internal:8080
    tools:
      - name: get_payslip
        access: read
      - name: raise_salary
        access: write
        sensitive: true
        summary: "Raise salary of {employee}"
"#;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

#[test]
fn loads_yaml_with_humantime_durations() {
    // GIVEN: a full gateway config file
    let file = write_config(GATEWAY_YAML);

    // WHEN: loading it
    let config = Config::load(Some(file.path())).unwrap();

    // THEN: sections and defaults are resolved
    assert_eq!(config.server.port, 40100);
    assert_eq!(config.confirmation.ttl, Duration::from_secs(120));
    assert_eq!(config.confirmation.backend, ConfirmationBackend::Memory);
    assert_eq!(config.defense.delimiter_ttl, Duration::from_secs(900));
    assert!(config.defense.strict);
    assert_eq!(config.identity.ignored_audiences, vec!["account".to_string()]);
    assert_eq!(
        config.identity.resolved_jwks_uri(),
        "https://idp.example.com/realms/corp/protocol/openid-connect/certs"
    );
    let payroll = &config.domains["payroll"];
    assert_eq!(payroll.tools.len(), 2);
    assert!(payroll.tools[1].sensitive);
}

#[test]
fn policy_from_loaded_config() {
    let file = write_config(GATEWAY_YAML);
    let config = Config::load(Some(file.path())).unwrap();
    let engine = RolePolicyEngine::from_config(&config.roles).unwrap();

    let writer = Principal::with_roles("alice", &["payroll-write"]);
    assert!(engine.authorize(&writer, "payroll", AccessLevel::Read));
    assert!(engine.authorize(&writer, "payroll", AccessLevel::Write));

    let nobody = Principal::with_roles("carol", &["unrelated"]);
    assert_eq!(
        engine.decide(&nobody, "handbook", AccessLevel::Read),
        Decision::PublicRead
    );
    assert!(!engine.authorize(&nobody, "handbook", AccessLevel::Write));

    let bot = Principal::with_roles("qa-bot", &["executive"]);
    assert_eq!(
        engine.decide(&bot, "payroll", AccessLevel::Write),
        Decision::SuperuserRefused
    );
    let ceo = Principal::with_roles("dana", &["executive"]);
    assert_eq!(
        engine.decide(&ceo, "payroll", AccessLevel::Write),
        Decision::Superuser
    );
}

#[test]
fn missing_file_is_a_config_error() {
    let result = Config::load(Some(std::path::Path::new("/nonexistent/gateway.yaml")));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn tool_domain_without_role_entry_is_rejected() {
    let yaml = r"
domains:
  tax:
    service_key_prefix: tax
    base_url: http://tax.internal
";
    let file = write_config(yaml);
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("role matrix"));
}

#[test]
fn private_domain_with_empty_roles_is_rejected() {
    let yaml = r"
roles:
  domains:
    payroll:
      read_roles: [payroll-read]
";
    let file = write_config(yaml);
    assert!(matches!(
        Config::load(Some(file.path())),
        Err(Error::Config(_))
    ));
}

#[test]
fn duplicate_key_prefixes_are_rejected() {
    let yaml = r"
roles:
  domains:
    a: { public: true }
    b: { public: true }
domains:
  a: { service_key_prefix: shared, base_url: http://a.internal }
  b: { service_key_prefix: shared, base_url: http://b.internal }
";
    let file = write_config(yaml);
    let err = Config::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("more than one domain"));
}

#[test]
fn resolved_config_renders_as_yaml() {
    let file = write_config(GATEWAY_YAML);
    let config = Config::load(Some(file.path())).unwrap();
    let yaml = serde_yaml::to_string(&config).unwrap();
    assert!(yaml.contains("service_key_prefix: payroll"));
    assert!(yaml.contains("ttl: 2m"));
}
