//! Tests for chatrelay-core: ids, messages, safety levels, errors, config loading

use chatrelay_core::*;
use std::io::Write;

// ===========================================================================
// Ids
// ===========================================================================

#[test]
fn session_id_accepts_safe_characters() {
    let id = SessionId::parse("user_42-chat").unwrap();
    assert_eq!(id.as_str(), "user_42-chat");
    assert_eq!(format!("{}", id), "user_42-chat");
}

#[test]
fn session_id_rejects_path_characters() {
    for raw in ["../etc/passwd", "a/b", "with space", "dot.json", ""] {
        let err = SessionId::parse(raw).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest, "{raw:?}");
    }
}

#[test]
fn session_id_length_limit() {
    let ok = "a".repeat(MAX_SESSION_ID_LEN);
    assert!(SessionId::parse(&ok).is_ok());
    let too_long = "a".repeat(MAX_SESSION_ID_LEN + 1);
    assert!(SessionId::parse(&too_long).is_err());
}

#[test]
fn backend_id_serde_is_plain_string() {
    let id = BackendId::new("hermes-7b");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, r#""hermes-7b""#);
    let back: BackendId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

// ===========================================================================
// Messages and roles
// ===========================================================================

#[test]
fn message_constructors_set_role() {
    assert_eq!(Message::system("s").role, Role::System);
    assert_eq!(Message::user("u").role, Role::User);
    assert_eq!(Message::assistant("a").role, Role::Assistant);
}

#[test]
fn message_serde_roundtrip() {
    let msg = Message::user("hello");
    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains(r#""role":"user""#));
    let back: Message = serde_json::from_str(&json).unwrap();
    assert_eq!(back, msg);
}

// ===========================================================================
// Safety level
// ===========================================================================

#[test]
fn strict_blocks_monitored_categories() {
    assert_eq!(
        SafetyLevel::Strict.adjust(ModerationAction::Monitor),
        ModerationAction::Block
    );
    assert_eq!(
        SafetyLevel::Strict.adjust(ModerationAction::Allow),
        ModerationAction::Allow
    );
}

#[test]
fn relaxed_allows_monitored_categories() {
    assert_eq!(
        SafetyLevel::Relaxed.adjust(ModerationAction::Monitor),
        ModerationAction::Allow
    );
    assert_eq!(
        SafetyLevel::Relaxed.adjust(ModerationAction::Block),
        ModerationAction::Block
    );
}

#[test]
fn standard_is_identity() {
    for action in [
        ModerationAction::Allow,
        ModerationAction::Monitor,
        ModerationAction::Block,
    ] {
        assert_eq!(SafetyLevel::Standard.adjust(action), action);
    }
}

// ===========================================================================
// Backend source
// ===========================================================================

#[test]
fn inline_credential_wins() {
    let source = BackendSource::Remote {
        model: "m".into(),
        base_url: "http://localhost".into(),
        api_key_env: Some("CHATRELAY_TEST_UNSET_KEY_VAR".into()),
        api_key: Some("sk-inline".into()),
    };
    assert_eq!(source.credential().as_deref(), Some("sk-inline"));
}

#[test]
fn blank_credential_is_missing() {
    let source = BackendSource::Remote {
        model: "m".into(),
        base_url: "http://localhost".into(),
        api_key_env: Some("CHATRELAY_TEST_UNSET_KEY_VAR".into()),
        api_key: Some("   ".into()),
    };
    assert!(source.credential().is_none());
}

// ===========================================================================
// Errors
// ===========================================================================

#[test]
fn error_kinds() {
    assert_eq!(
        Error::UnknownPersona("x".into()).kind(),
        ErrorKind::UnknownPersona
    );
    assert_eq!(
        Error::SlotBusy {
            slot: 0,
            occupant: "a".into()
        }
        .kind(),
        ErrorKind::SlotBusy
    );
    assert_eq!(Error::config("bad").kind(), ErrorKind::Config);
}

#[test]
fn client_and_retryable_classification() {
    assert!(ErrorKind::ContentRejected.is_client_error());
    assert!(!ErrorKind::ContentRejected.is_retryable());
    assert!(ErrorKind::SlotBusy.is_retryable());
    assert!(!ErrorKind::InsufficientBudget.is_retryable());
    assert!(!ErrorKind::InsufficientBudget.is_client_error());
}

#[test]
fn insufficient_budget_message_names_numbers() {
    let err = Error::InsufficientBudget {
        backend: "big".into(),
        cost: 24,
        budget: 16,
        slot: 0,
    };
    let msg = err.to_string();
    assert!(msg.contains("24") && msg.contains("16"), "{}", msg);
}

// ===========================================================================
// Config
// ===========================================================================

const SAMPLE: &str = r#"
[server]
port = 9100
bind = "lan"
default_persona = "pirate"

[sessions]
window_size = 6
ttl_secs = 60

[residency]
slots = [{ budget_units = 16 }, { budget_units = 8 }]
acquire_timeout_ms = 500

[moderation]
blacklist = ["forbidden"]
max_chars = 200

[moderation.categories]
political = "allow"

[[backends]]
id = "gpt"
kind = "remote"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"

[[backends]]
id = "hermes"
kind = "local"
category = "roleplay"
artifact = "models/hermes.gguf"
cost_units = 8
slot = 1

[[personas]]
id = "pirate"
system_prompt = "Talk like a pirate."
allowed_categories = ["roleplay"]
allowed_backends = ["gpt"]
default_backend = "hermes"
safety_level = "strict"
"#;

#[test]
fn config_parses_all_sections() {
    let config = AppConfig::from_toml_str(SAMPLE).unwrap();
    config.validate().unwrap();
    assert_eq!(config.server.port, 9100);
    assert_eq!(config.server.bind.to_addr(), "0.0.0.0");
    assert_eq!(config.server.default_persona.as_deref(), Some("pirate"));
    assert_eq!(config.sessions.window_size, 6);
    assert_eq!(config.residency.slots.len(), 2);
    assert_eq!(config.residency.acquire_timeout_ms, 500);
    assert_eq!(config.moderation.blacklist, vec!["forbidden"]);
    assert_eq!(
        config.moderation.categories.get("political"),
        Some(&ModerationAction::Allow)
    );
    assert_eq!(config.backends.len(), 2);
    assert_eq!(config.personas[0].safety_level, SafetyLevel::Strict);
}

#[test]
fn omitted_sections_take_defaults() {
    let config = AppConfig::from_toml_str("[server]\nport = 1234\n").unwrap();
    assert_eq!(config.server.port, 1234);
    assert_eq!(config.sessions.window_size, 20);
    assert_eq!(config.residency.slots.len(), 1);
    assert_eq!(config.residency.slots[0].budget_units, 16);
    assert!(config.generation.retry_transient);
}

#[test]
fn default_moderation_policy_blocks_hate() {
    let config = ModerationConfig::default();
    assert_eq!(
        config.categories.get("hate"),
        Some(&ModerationAction::Block)
    );
    assert_eq!(
        config.categories.get("violence"),
        Some(&ModerationAction::Monitor)
    );
}

#[test]
fn backend_descriptor_from_config() {
    let config = AppConfig::from_toml_str(SAMPLE).unwrap();
    let remote = config.backends[0].to_descriptor().unwrap();
    assert_eq!(remote.kind(), BackendKind::Remote);
    assert_eq!(remote.category, "general");
    assert_eq!(remote.context_limit, 4096);
    match &remote.source {
        BackendSource::Remote { model, base_url, .. } => {
            assert_eq!(model, "gpt-4o-mini");
            assert_eq!(base_url, "https://api.openai.com/v1");
        }
        _ => panic!("Expected remote source"),
    }

    let local = config.backends[1].to_descriptor().unwrap();
    assert!(local.is_local());
    assert_eq!(local.resource_cost_units, 8);
    assert_eq!(local.slot, 1);
    assert!(!local.available);
}

#[test]
fn duplicate_backend_ids_rejected() {
    let toml = r#"
        [[backends]]
        id = "a"
        kind = "remote"

        [[backends]]
        id = "a"
        kind = "remote"
    "#;
    let config = AppConfig::from_toml_str(toml).unwrap();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("duplicate"));
}

#[test]
fn zero_budget_slot_rejected() {
    let toml = "[residency]\nslots = [{ budget_units = 0 }]\n";
    let config = AppConfig::from_toml_str(toml).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.server.port, 8001);
    assert_eq!(config.personas[0].id, "assistant");
}

#[test]
fn load_malformed_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chatrelay.toml");
    std::fs::write(&path, "[server\nport = ").unwrap();
    let err = AppConfig::load(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn load_reads_system_prompt_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut prompt = std::fs::File::create(dir.path().join("pirate.txt")).unwrap();
    writeln!(prompt, "Arr, ye be a pirate.").unwrap();

    let path = dir.path().join("chatrelay.toml");
    std::fs::write(
        &path,
        r#"
[[backends]]
id = "gpt"
kind = "remote"

[[personas]]
id = "pirate"
system_prompt_file = "pirate.txt"
allowed_backends = ["gpt"]
default_backend = "gpt"
"#,
    )
    .unwrap();

    let config = AppConfig::load(&path).unwrap();
    assert_eq!(config.personas[0].system_prompt, "Arr, ye be a pirate.");
    assert!(config.personas[0].system_prompt_file.is_none());
}

#[test]
fn load_missing_prompt_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chatrelay.toml");
    std::fs::write(
        &path,
        r#"
[[personas]]
id = "ghost"
system_prompt_file = "nowhere.txt"
default_backend = "openai"
"#,
    )
    .unwrap();
    assert!(AppConfig::load(&path).is_err());
}
