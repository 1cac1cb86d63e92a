use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use tempfile::TempDir;
use uipilot_config::{AnalysisMode, CacheMode, Config, OVERRIDE_CACHE_ENV};
use uipilot_core::test_support::{code_reply, test_config, patterned_png, Pattern, ScriptedDriver};
use uipilot_core::{Pilot, PilotError};
use uipilot_oracle::{MockOracle, MockReply};

fn pilot(config: &Config, oracle: &MockOracle, driver: &ScriptedDriver) -> Pilot {
    Pilot::init(config, Arc::new(oracle.clone()), Arc::new(driver.clone())).unwrap()
}

#[tokio::test]
#[serial]
async fn test_cached_step_skips_oracle_in_next_session() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), CacheMode::Full);
    let oracle = MockOracle::new()
        .with_image_input(true)
        .with_reply(MockReply::text(&code_reply("tap(\"#login\")")));
    let driver = ScriptedDriver::new();
    let mut pilot = pilot(&config, &oracle, &driver);

    pilot.start().unwrap();
    let first = pilot.perform_step("Log in").await.unwrap();
    pilot.end(true).unwrap();

    pilot.start().unwrap();
    let second = pilot.perform_step("Log in").await.unwrap();
    pilot.end(true).unwrap();

    assert_eq!(first, json!("tapped #login"));
    assert_eq!(second, first);
    assert_eq!(oracle.call_count(), 1);
    // cached code still runs against the backend
    assert_eq!(driver.calls().len(), 2);
}

#[tokio::test]
#[serial]
async fn test_committed_cache_survives_a_new_pilot() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), CacheMode::Full);
    let driver = ScriptedDriver::new();

    let first_oracle = MockOracle::new().with_reply(MockReply::text(&code_reply("tap(\"#login\")")));
    let mut first = pilot(&config, &first_oracle, &driver);
    first.start().unwrap();
    first.perform_step("Log in").await.unwrap();
    first.end(true).unwrap();
    assert!(config.engine.cache_path.exists());

    let second_oracle = MockOracle::new();
    let mut second = pilot(&config, &second_oracle, &driver);
    second.start().unwrap();
    let result = second.perform_step("Log in").await.unwrap();

    assert_eq!(result, json!("tapped #login"));
    assert_eq!(second_oracle.call_count(), 0);
}

#[tokio::test]
#[serial]
async fn test_failing_cached_code_is_replaced_after_regeneration() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), CacheMode::Full);

    // cached while the banner exists
    let banner_driver = ScriptedDriver::new();
    banner_driver.set_text("#banner", "Welcome");
    let first_oracle = MockOracle::new().with_reply(MockReply::text(&code_reply("read_text(\"#banner\")")));
    let mut first = pilot(&config, &first_oracle, &banner_driver);
    first.start().unwrap();
    first.perform_step("Log in").await.unwrap();
    first.end(true).unwrap();

    // the banner is gone: the cached snippet fails and is regenerated
    let driver = ScriptedDriver::new();
    let second_oracle = MockOracle::new().with_reply(MockReply::text(&code_reply("tap(\"#login\")")));
    let mut second = pilot(&config, &second_oracle, &driver);
    second.start().unwrap();
    let result = second.perform_step("Log in").await.unwrap();
    second.end(true).unwrap();
    assert_eq!(result, json!("tapped #login"));
    assert_eq!(second_oracle.call_count(), 1);
    assert_eq!(second.cache().durable_len(), 1);

    let third_oracle = MockOracle::new();
    let mut third = pilot(&config, &third_oracle, &driver);
    third.start().unwrap();
    let result = third.perform_step("Log in").await.unwrap();
    third.end(true).unwrap();

    assert_eq!(result, json!("tapped #login"));
    assert_eq!(third_oracle.call_count(), 0);
    let names: Vec<String> = driver.calls().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["read_text", "tap", "tap"]);
}

#[tokio::test]
#[serial]
async fn test_full_mode_misses_on_a_different_screen() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), CacheMode::Full);
    let oracle = MockOracle::new().with_default_reply(MockReply::text(&code_reply("tap(\"#ok\")")));
    let driver = ScriptedDriver::new();
    let mut pilot = pilot(&config, &oracle, &driver);

    pilot.start().unwrap();
    pilot.perform_step("Confirm").await.unwrap();
    pilot.end(true).unwrap();

    driver.set_screen(Some(patterned_png(Pattern::TopDark)), "<dialog id=\"confirm\"/>");
    pilot.start().unwrap();
    pilot.perform_step("Confirm").await.unwrap();
    pilot.end(true).unwrap();

    assert_eq!(oracle.call_count(), 2);
}

#[tokio::test]
#[serial]
async fn test_lightweight_mode_ignores_the_screen() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), CacheMode::Lightweight);
    let oracle = MockOracle::new().with_default_reply(MockReply::text(&code_reply("tap(\"#ok\")")));
    let driver = ScriptedDriver::new();
    let mut pilot = pilot(&config, &oracle, &driver);

    pilot.start().unwrap();
    pilot.perform_step("Confirm").await.unwrap();
    pilot.end(true).unwrap();

    driver.set_screen(None, "<dialog id=\"confirm\"/>");
    pilot.start().unwrap();
    pilot.perform_step("Confirm").await.unwrap();
    pilot.end(true).unwrap();

    assert_eq!(oracle.call_count(), 1);
}

#[tokio::test]
#[serial]
async fn test_disabled_cache_always_generates() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), CacheMode::Disabled);
    let oracle = MockOracle::new().with_default_reply(MockReply::text(&code_reply("tap(\"#ok\")")));
    let driver = ScriptedDriver::new();
    let mut pilot = pilot(&config, &oracle, &driver);

    for _ in 0..2 {
        pilot.start().unwrap();
        pilot.perform_step("Confirm").await.unwrap();
        pilot.end(true).unwrap();
    }

    assert_eq!(oracle.call_count(), 2);
    assert!(!config.engine.cache_path.exists());
}

#[tokio::test]
#[serial]
async fn test_retry_then_succeed() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), CacheMode::Full);
    let oracle = MockOracle::new().with_replies(vec![
        MockReply::error("upstream timeout"),
        MockReply::text(&code_reply("tap(\"#login\")")),
    ]);
    let driver = ScriptedDriver::new();
    let mut pilot = pilot(&config, &oracle, &driver);

    pilot.start().unwrap();
    let result = pilot.perform_step("Log in").await.unwrap();

    assert_eq!(result, json!("tapped #login"));
    assert_eq!(oracle.call_count(), 2);
    assert_eq!(pilot.cache().staged_len(), 1);

    let retry_prompt = &oracle.prompts()[1].prompt;
    assert!(retry_prompt.contains("Failed to generate code for \"Log in\""));
    assert!(retry_prompt.contains("upstream timeout"));
}

#[tokio::test]
#[serial]
async fn test_evaluation_failure_is_fed_back_to_the_next_attempt() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), CacheMode::Full);
    let oracle = MockOracle::new().with_replies(vec![
        MockReply::text(&code_reply("shared.tries = 1; tap(\"#missing\"); fail(\"element #missing not found\")")),
        MockReply::text(&code_reply("tap(\"#login\")")),
    ]);
    let driver = ScriptedDriver::new();
    let mut pilot = pilot(&config, &oracle, &driver);

    pilot.start().unwrap();
    pilot.perform_step("Log in").await.unwrap();

    let retry_prompt = &oracle.prompts()[1].prompt;
    assert!(retry_prompt.contains("Failed to perform \"Log in\""));
    assert!(retry_prompt.contains("element #missing not found"));

    let session = pilot.session().unwrap();
    assert!(session.shared_state.get("tries").is_none());
    assert_eq!(session.previous_steps.len(), 1);
    assert_eq!(session.previous_steps[0].code, "tap(\"#login\")");
}

#[tokio::test]
#[serial]
async fn test_retry_exhaustion_returns_last_error() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), CacheMode::Full);
    let oracle = MockOracle::new().with_replies(vec![
        MockReply::error("first failure"),
        MockReply::error("second failure"),
    ]);
    let driver = ScriptedDriver::new();
    let mut pilot = pilot(&config, &oracle, &driver);

    pilot.start().unwrap();
    let err = pilot.perform_step("Log in").await.unwrap_err();

    match err.downcast_ref::<PilotError>() {
        Some(PilotError::Generation(message)) => assert!(message.contains("second failure")),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(oracle.call_count(), 2);
    assert_eq!(pilot.cache().staged_len(), 0);
    assert!(pilot.session().unwrap().previous_steps.is_empty());
}

#[tokio::test]
#[serial]
async fn test_empty_code_is_a_generation_failure() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), CacheMode::Full);
    config.engine.max_attempts = 1;
    let oracle = MockOracle::new().with_reply(MockReply::text("```\n\n```"));
    let driver = ScriptedDriver::new();
    let mut pilot = pilot(&config, &oracle, &driver);

    pilot.start().unwrap();
    let err = pilot.perform_step("Log in").await.unwrap_err();

    assert!(matches!(err.downcast_ref::<PilotError>(), Some(PilotError::Generation(_))));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
#[serial]
async fn test_full_analysis_runs_two_extra_passes() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), CacheMode::Full);
    config.engine.analysis_mode = AnalysisMode::Full;
    let oracle = MockOracle::new().with_replies(vec![
        MockReply::text("The login button is #login"),
        MockReply::text("Use tap(\"#login\")"),
        MockReply::text(&code_reply("tap(\"#login\")")),
    ]);
    let driver = ScriptedDriver::new();
    let mut pilot = pilot(&config, &oracle, &driver);

    pilot.start().unwrap();
    pilot.perform_step("Log in").await.unwrap();

    let prompts = oracle.prompts();
    assert_eq!(prompts.len(), 3);
    assert!(prompts[1].prompt.contains("The login button is #login"));
    assert!(prompts[2].prompt.contains("The login button is #login"));
    assert!(prompts[2].prompt.contains("Use tap(\"#login\")"));
}

#[tokio::test]
#[serial]
async fn test_screenshot_only_sent_to_image_capable_oracles() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), CacheMode::Disabled);
    let driver = ScriptedDriver::new();

    let blind = MockOracle::new().with_default_reply(MockReply::text(&code_reply("tap(\"#a\")")));
    let mut pilot_blind = pilot(&config, &blind, &driver);
    pilot_blind.start().unwrap();
    pilot_blind.perform_step("Tap a").await.unwrap();
    assert!(blind.prompts()[0].image.is_none());
    assert_eq!(driver.image_captures(), 0);

    let seeing = MockOracle::new()
        .with_image_input(true)
        .with_default_reply(MockReply::text(&code_reply("tap(\"#a\")")));
    let mut pilot_seeing = pilot(&config, &seeing, &driver);
    pilot_seeing.start().unwrap();
    pilot_seeing.perform_step("Tap a").await.unwrap();
    let image = seeing.prompts()[0].image.clone().unwrap();
    assert_eq!(image.media_type, "image/png");
}

#[tokio::test]
#[serial]
async fn test_env_override_bypasses_lookups_but_keeps_writing() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), CacheMode::Lightweight);
    let oracle = MockOracle::new().with_default_reply(MockReply::text(&code_reply("tap(\"#ok\")")));
    let driver = ScriptedDriver::new();

    std::env::set_var(OVERRIDE_CACHE_ENV, "1");
    let mut pilot = pilot(&config, &oracle, &driver);
    std::env::remove_var(OVERRIDE_CACHE_ENV);

    assert!(pilot.cache().is_bypassed());
    for _ in 0..2 {
        pilot.start().unwrap();
        pilot.perform_step("Confirm").await.unwrap();
        pilot.end(true).unwrap();
    }

    assert_eq!(oracle.call_count(), 2);
    assert!(config.engine.cache_path.exists());
}
