#[cfg(test)]
mod tests {
    use bastion_config::ConfigLoader;
    use bastion_config::schema::*;
    use std::io::Write;
    use std::path::PathBuf;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.cpu_seconds, 5.0);
        assert_eq!(config.memory_mb, 64);
        assert_eq!(config.max_output_bytes, 64 * 1024);
        assert_eq!(config.tick_ms, 10);
        assert_eq!(config.max_violations, 3);
    }

    #[test]
    fn test_permissions_config_defaults() {
        let config = PermissionsConfig::default();
        assert!(config.auto_grant_normal);
        assert!(config.never_grant.is_empty());
    }

    #[test]
    fn test_plugins_config_defaults() {
        let config = PluginsConfig::default();
        assert_eq!(config.install_dir, PathBuf::from("plugins"));
        assert_eq!(config.grants_file, PathBuf::from("grants.toml"));
        assert_eq!(config.enabled_file, PathBuf::from("enabled.toml"));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
    }

    // ── TOML roundtrip tests ───────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = BastionConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: BastionConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.sandbox.memory_mb, config.sandbox.memory_mb);
        assert_eq!(restored.plugins.install_dir, config.plugins.install_dir);
        assert_eq!(restored.host.data_dir, config.host.data_dir);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[sandbox]
cpu_seconds = 1.5

[permissions]
never_grant = ["process.spawn"]
"#;
        let config: BastionConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sandbox.cpu_seconds, 1.5);
        assert_eq!(config.permissions.never_grant, vec!["process.spawn".to_string()]);
        // Defaults should fill in
        assert_eq!(config.sandbox.memory_mb, 64);
        assert!(config.permissions.auto_grant_normal);
        assert_eq!(config.logging.format, "pretty");
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_validate_rejects_bad_host_version() {
        let mut config = BastionConfig::default();
        config.host.version = Some("one.two".into());
        let err = config.validate().unwrap_err();
        assert!(err.contains("host.version"));
    }

    #[test]
    fn test_validate_rejects_zero_ceilings() {
        let mut config = BastionConfig::default();
        config.sandbox.cpu_seconds = 0.0;
        config.sandbox.memory_mb = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("sandbox.cpu_seconds"));
        assert!(err.contains("sandbox.memory_mb"));
    }

    #[test]
    fn test_validate_rejects_unreasonable_cpu_ceiling() {
        let mut config = BastionConfig::default();
        config.sandbox.cpu_seconds = 1e20;
        let err = config.validate().unwrap_err();
        assert!(err.contains("sandbox.cpu_seconds"));
        assert!(ConfigLoader::from_config(config.clone()).is_err());

        config.sandbox.cpu_seconds = bastion_config::schema::MAX_CPU_SECONDS;
        let warnings = config.validate().unwrap();
        assert!(warnings
            .iter()
            .any(|w| w.field == "sandbox.cpu_seconds" && w.severity == WarningSeverity::Warning));
    }

    #[test]
    fn test_validate_warns_on_unknown_format() {
        let mut config = BastionConfig::default();
        config.logging.format = "xml".into();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "logging.format"));
    }

    #[test]
    fn test_warning_display() {
        let w = ConfigWarning {
            field: "sandbox.tick_ms".into(),
            message: "too coarse".into(),
            severity: WarningSeverity::Warning,
            hint: Some("use 10".into()),
        };
        assert_eq!(w.to_string(), "warning: sandbox.tick_ms: too coarse (use 10)");
    }

    // ── ConfigLoader tests ─────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("bastion.toml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(
            f,
            r#"
[host]
version = "2.1.0"
data_dir = "/var/lib/bastion"

[sandbox]
memory_mb = 16
max_violations = 0
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert_eq!(config.host.version.as_deref(), Some("2.1.0"));
        assert_eq!(config.sandbox.memory_mb, 16);
        assert_eq!(config.sandbox.max_violations, 0);
        assert_eq!(config.install_dir(), PathBuf::from("/var/lib/bastion/plugins"));
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_invalid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("bastion.toml");
        std::fs::write(&config_path, "[sandbox]\nmemory_mb = 0\n").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());

        std::fs::write(&config_path, "this is = = not toml").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());
    }

    #[test]
    fn test_config_loader_reload_keeps_old_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("bastion.toml");
        std::fs::write(&config_path, "[sandbox]\ntick_ms = 20\n").unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        assert_eq!(loader.get().sandbox.tick_ms, 20);

        std::fs::write(&config_path, "[sandbox]\ntick_ms = 5\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().sandbox.tick_ms, 5);

        std::fs::write(&config_path, "[sandbox]\ntick_ms = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().sandbox.tick_ms, 5);
    }

    #[test]
    fn test_from_config_validates() {
        let mut config = BastionConfig::default();
        assert!(ConfigLoader::from_config(config.clone()).is_ok());
        config.sandbox.tick_ms = 0;
        assert!(ConfigLoader::from_config(config).is_err());
    }

    // ── JSON roundtrip ─────────────────────────────────────────

    #[test]
    fn test_config_json_roundtrip() {
        let config = BastionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let restored: BastionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.sandbox.tick_ms, config.sandbox.tick_ms);
    }
}
