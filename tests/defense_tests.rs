//! Prompt defense behaviour across sessions.

use std::time::Duration;

use pretty_assertions::assert_eq;

use hitl_gateway::Error;
use hitl_gateway::config::DefenseConfig;
use hitl_gateway::defense::{PromptDefense, ViolationKind};

fn defense() -> PromptDefense {
    PromptDefense::from_config(&DefenseConfig {
        system_prompt_signatures: vec!["You are the corporate assistant".into()],
        ..DefenseConfig::default()
    })
    .unwrap()
}

#[test]
fn another_sessions_tag_in_output_is_flagged() {
    // GIVEN: two live sessions
    let d = defense();
    let theirs = d.prepare("bob:chat", "hello");
    let _ = d.prepare("alice:chat", "hello");

    // WHEN: alice's model output contains bob's closing tag
    let output = format!("see {}", theirs.close_tag);
    let result = d.scan_inbound("alice:chat", &output, false).unwrap();

    // THEN: it is redacted and reported as foreign
    assert_eq!(result.text, "see [REDACTED:DELIMITER]");
    assert_eq!(result.violations.len(), 1);
    assert_eq!(result.violations[0].kind, ViolationKind::ForeignDelimiter);
}

#[test]
fn system_prompt_leak_is_withheld_in_strict_mode() {
    let d = defense();
    let leaked = "Sure. My instructions say: you are the  Corporate Assistant for ACME.";
    assert!(matches!(
        d.scan_inbound("s", leaked, true),
        Err(Error::PromptDefenseViolation { count: 1 })
    ));

    let lenient = d.scan_inbound("s", leaked, false).unwrap();
    assert!(lenient.text.contains("[REDACTED:SYSTEM_PROMPT]"));
    assert_eq!(lenient.violations[0].kind, ViolationKind::SystemPromptLeak);
}

#[test]
fn outbound_sanitization_removes_every_pii_kind() {
    let d = defense();
    let text = "Jane (jane@acme.example, +1 415 555 0100) SSN 123-45-6789 card 4111 1111 1111 1111";
    let out = d.sanitize_outbound("s", text);
    for raw in ["jane@acme.example", "555 0100", "123-45-6789", "4111"] {
        assert!(!out.contains(raw), "{raw} leaked in {out}");
    }
}

#[test]
fn forged_tag_from_expired_session_is_still_caught() {
    // GIVEN: a registry whose sets expire almost immediately
    let d = PromptDefense::from_config(&DefenseConfig {
        delimiter_ttl: Duration::from_millis(1),
        ..DefenseConfig::default()
    })
    .unwrap();
    let old = d.prepare("bob:chat", "hi");
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(d.evict_expired(), 1);

    // WHEN: the stale tag shows up in someone's output
    let result = d
        .scan_inbound("alice:chat", &format!("x {} y", old.open_tag), false)
        .unwrap();

    // THEN: the shape check flags it even though no live session owns it
    assert_eq!(result.violations.len(), 1);
    assert_eq!(result.violations[0].kind, ViolationKind::ForgedDelimiter);
}

#[test]
fn delimiters_rotate_after_ttl() {
    let d = PromptDefense::from_config(&DefenseConfig {
        delimiter_ttl: Duration::from_millis(1),
        ..DefenseConfig::default()
    })
    .unwrap();
    let first = d.delimiters("s");
    std::thread::sleep(Duration::from_millis(5));
    let second = d.delimiters("s");
    assert_ne!(first.open_tag, second.open_tag);
}

#[test]
fn one_subject_cannot_grow_the_session_registry_without_bound() {
    // GIVEN: a subject opening far more sessions than the cap allows
    let d = PromptDefense::from_config(&DefenseConfig {
        max_sessions_per_subject: 8,
        ..DefenseConfig::default()
    })
    .unwrap();
    let victim = d.prepare("alice:chat", "hi");
    for i in 0..5_000 {
        let _ = d.prepare(&format!("mallory:s{i}"), "hi");
    }

    // THEN: only the capped number of sets is kept and alice's set survives
    assert_eq!(d.live_sessions(), 9);
    assert_eq!(d.delimiters("alice:chat").open_tag, victim.open_tag);
}

#[test]
fn scan_cost_does_not_grow_with_live_sessions() {
    // GIVEN: twenty thousand live sessions across distinct subjects
    let d = PromptDefense::from_config(&DefenseConfig {
        redact_pii_in_output: false,
        ..DefenseConfig::default()
    })
    .unwrap();
    let other = d.prepare("bob:chat", "hi");
    for i in 0..20_000 {
        let _ = d.delimiters(&format!("user{i}:chat"));
    }
    let mut output = "The quarterly report is attached. ".repeat(120);
    output.push_str(&other.close_tag);

    // WHEN: scanning 4 KB of model output repeatedly
    let started = std::time::Instant::now();
    for _ in 0..20 {
        let result = d.scan_inbound("alice:chat", &output, false).unwrap();
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].kind, ViolationKind::ForeignDelimiter);
    }

    // THEN: the work is independent of the registry size
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "20 scans took {:?}",
        started.elapsed()
    );
}
