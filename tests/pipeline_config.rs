// tests/pipeline_config.rs
use std::{env, fs};

use news_digest::config::{DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH, ENV_MAX_CONCURRENCY, ENV_MIN_RELEVANCE};
use news_digest::PipelineConfig;

#[test]
fn shipped_config_parses_and_validates() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
    let cfg = PipelineConfig::load_from(&path).unwrap();
    assert!(cfg.validate().is_ok());
    assert!(!cfg.sources.is_empty());
    assert_eq!(cfg.themes.len(), 3);
    assert!(cfg.themes.iter().all(|t| t.enabled && !t.keywords.is_empty()));
    assert!(!cfg.ai.enabled());
}

#[serial_test::serial]
#[test]
fn default_uses_env_path_then_fallbacks() {
    // Isolate CWD so the repo's own config/ is not read.
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    env::remove_var(ENV_CONFIG_PATH);
    env::remove_var(ENV_MIN_RELEVANCE);
    env::remove_var(ENV_MAX_CONCURRENCY);

    // 1) nothing on disk -> defaults
    let cfg = PipelineConfig::load_default().unwrap();
    assert!(cfg.sources.is_empty());
    assert_eq!(cfg.classify.min_relevance, 0.5);

    // 2) ./config/pipeline.toml
    fs::create_dir_all(tmp.path().join("config")).unwrap();
    fs::write(
        tmp.path().join(DEFAULT_CONFIG_PATH),
        "[classify]\nmin_relevance = 0.7\n",
    )
    .unwrap();
    let cfg = PipelineConfig::load_default().unwrap();
    assert_eq!(cfg.classify.min_relevance, 0.7);

    // 3) env path wins, env overrides apply last
    let p_env = tmp.path().join("other.toml");
    fs::write(&p_env, "[aggregate]\nmax_concurrency = 3\n").unwrap();
    env::set_var(ENV_CONFIG_PATH, p_env.display().to_string());
    env::set_var(ENV_MIN_RELEVANCE, "1.7");
    let cfg = PipelineConfig::load_default().unwrap();
    assert_eq!(cfg.aggregate.max_concurrency, 3);
    assert_eq!(cfg.classify.min_relevance, 1.0);

    // 4) env path pointing nowhere is an error
    env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
    assert!(PipelineConfig::load_default().is_err());

    env::remove_var(ENV_CONFIG_PATH);
    env::remove_var(ENV_MIN_RELEVANCE);
    env::set_current_dir(&old).unwrap();
}

#[test]
fn invalid_settings_are_rejected() {
    let cfg = PipelineConfig::from_toml_str("[cluster]\nk = 0\n").unwrap();
    assert!(cfg.validate().is_err());

    let cfg = PipelineConfig::from_toml_str("[quality.a]\ncoverage = 0.3\nmax_vague = 2\nspecificity = 50.0\n").unwrap();
    assert!(cfg.validate().is_err());
}
