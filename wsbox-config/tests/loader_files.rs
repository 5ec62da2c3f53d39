use std::fs;

use serial_test::serial;
use wsbox_config::{CONFIG_ENV_VAR, CONFIG_FILE_NAME, ConfigLoader, ENGINE_ROOT_ENV};

#[test]
fn loads_file_from_search_dir() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(
        dir.path().join(CONFIG_FILE_NAME),
        "default_isolation_profile = \"standard\"\n",
    )?;

    let loaded = ConfigLoader::new()
        .with_search_dir(dir.path())
        .load_with_env(|_| None)?;

    assert_eq!(loaded.config.default_isolation_profile, "standard");
    assert_eq!(loaded.source, Some(dir.path().join(CONFIG_FILE_NAME)));
    Ok(())
}

#[test]
fn missing_search_file_yields_defaults() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let loaded = ConfigLoader::new()
        .with_search_dir(dir.path())
        .load_with_env(|_| None)?;
    assert!(loaded.source.is_none());
    assert_eq!(loaded.config.default_isolation_profile, "restricted");
    Ok(())
}

#[test]
fn explicit_missing_path_is_an_error() {
    let result = ConfigLoader::new()
        .with_path("/nonexistent/wsbox.toml")
        .load_with_env(|_| None);
    assert!(result.is_err());
}

#[test]
fn invalid_file_reports_the_path() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("broken.toml");
    fs::write(&path, "process = 12\n")?;
    let err = ConfigLoader::new()
        .with_path(&path)
        .load_with_env(|_| None)
        .unwrap_err();
    assert!(format!("{err:#}").contains("broken.toml"));
    Ok(())
}

#[test]
#[serial]
fn process_environment_is_consulted() -> anyhow::Result<()> {
    let config_dir = assert_fs::TempDir::new()?;
    let config_path = config_dir.path().join("custom.toml");
    fs::write(&config_path, "[process]\nkill_grace_seconds = 1\n")?;

    // SAFETY: serialized with every other test touching the environment.
    unsafe {
        std::env::set_var(CONFIG_ENV_VAR, &config_path);
        std::env::set_var(ENGINE_ROOT_ENV, config_dir.path());
    }
    let loaded = ConfigLoader::new().load();
    unsafe {
        std::env::remove_var(CONFIG_ENV_VAR);
        std::env::remove_var(ENGINE_ROOT_ENV);
    }

    let loaded = loaded?;
    assert_eq!(loaded.config.process.kill_grace_seconds, 1);
    assert_eq!(loaded.config.engine_root, config_dir.path());
    Ok(())
}
