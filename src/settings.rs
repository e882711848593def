use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::EngineConfig;

/// Location of the persisted engine settings.
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("focusstack")
        .join("settings.json")
}

pub fn save_settings(config: &EngineConfig) -> Result<PathBuf> {
    let path = settings_path();
    save_settings_to(config, &path)?;
    Ok(path)
}

pub fn save_settings_to(config: &EngineConfig, settings_path: &Path) -> Result<()> {
    if let Some(parent) = settings_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(settings_path, json)?;

    log::info!("Settings saved to: {}", settings_path.display());
    Ok(())
}

pub fn load_settings() -> EngineConfig {
    load_settings_from(&settings_path())
}

/// Read settings, falling back to defaults when the file is missing, unreadable
/// or does not describe a valid configuration.
pub fn load_settings_from(settings_path: &Path) -> EngineConfig {
    if !settings_path.exists() {
        log::info!("No settings file found. Using defaults.");
        return EngineConfig::default();
    }

    match std::fs::read_to_string(settings_path) {
        Ok(json) => match serde_json::from_str::<EngineConfig>(&json) {
            Ok(config) => match config.validate() {
                Ok(()) => {
                    log::info!("Settings loaded from: {}", settings_path.display());
                    config
                }
                Err(e) => {
                    log::warn!("Settings file {} is invalid: {}. Using defaults.", settings_path.display(), e);
                    EngineConfig::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to parse settings file: {}. Using defaults.", e);
                EngineConfig::default()
            }
        },
        Err(e) => {
            log::warn!("Failed to read settings file: {}. Using defaults.", e);
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MotionModel;

    #[test]
    fn test_save_then_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("settings.json");

        let mut config = EngineConfig::new(4, 2);
        config.alignment.motion_model = MotionModel::Affine;
        config.resident_levels = Some(40);
        save_settings_to(&config, &path)?;

        assert_eq!(load_settings_from(&path), config);
        Ok(())
    }

    #[test]
    fn test_missing_or_corrupt_file_gives_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("settings.json");
        assert_eq!(load_settings_from(&path), EngineConfig::default());

        std::fs::write(&path, "{ not json")?;
        assert_eq!(load_settings_from(&path), EngineConfig::default());

        std::fs::write(&path, r#"{ "pyramid_depth": 0 }"#)?;
        assert_eq!(load_settings_from(&path), EngineConfig::default());
        Ok(())
    }
}
