//! Configuration loading: TOML team settings and YAML role documents.

use std::path::Path;

use thiserror::Error;

use crate::domain::models::{RoleDefinition, TeamSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(String),
    #[error("failed to read configuration: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse team settings: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to parse role definition {path}: {source}")]
    ParseYaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("validation failed for {path}: {reason}")]
    ValidationError { path: String, reason: String },
}

/// Load team settings from a TOML document. A missing file yields the
/// defaults so `drover run` works out of the box.
pub fn load_settings(path: &Path) -> Result<TeamSettings, ConfigError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no settings file; using defaults");
        return Ok(TeamSettings::default());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}

/// Load every role definition from a directory of YAML documents, one
/// role per file, in file-name order.
pub fn load_roles(dir: &Path) -> Result<Vec<RoleDefinition>, ConfigError> {
    if !dir.is_dir() {
        return Err(ConfigError::FileNotFound(dir.display().to_string()));
    }

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml" | "yml")
            )
        })
        .collect();
    paths.sort();

    let mut roles = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = std::fs::read_to_string(&path)?;
        let role: RoleDefinition =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::ParseYaml {
                path: path.display().to_string(),
                source,
            })?;
        role.validate()
            .map_err(|reason| ConfigError::ValidationError {
                path: path.display().to_string(),
                reason,
            })?;
        roles.push(role);
    }
    Ok(roles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_settings_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(settings.guardrails.max_task_depth, 10);
    }

    #[test]
    fn test_load_settings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("team.toml");
        fs::write(
            &path,
            "database_path = \"/tmp/x.db\"\n[guardrails]\nrejection_cycle_limit = 2\n",
        )
        .unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.database_path, "/tmp/x.db");
        assert_eq!(settings.guardrails.rejection_cycle_limit, 2);
    }

    #[test]
    fn test_load_roles_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("10-pm.yaml"),
            "role: pm\ndisplay_name: Project Manager\nprefix: PM\naccepts: [goal]\nproduces: [implementation]\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("20-coder.yaml"),
            "role: coder\ndisplay_name: Coder\nprefix: CD\naccepts: [implementation]\nmax_instances: 3\nauto_scale:\n  enabled: true\n  scale_up_threshold: 2\n",
        )
        .unwrap();

        let roles = load_roles(dir.path()).unwrap();
        assert_eq!(roles.len(), 2);
        assert_eq!(roles[0].role, "pm");
        assert_eq!(roles[1].role, "coder");
        assert_eq!(roles[1].max_instances, 3);
        assert!(roles[1].auto_scale.enabled);
        assert_eq!(roles[1].auto_scale.scale_up_threshold, 2);
        // Unspecified auto_scale fields keep their defaults.
        assert_eq!(roles[1].auto_scale.cooldown_seconds, 30);
    }

    #[test]
    fn test_invalid_role_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("bad.yaml"),
            "role: broken\ndisplay_name: Broken\nprefix: BK\naccepts: []\n",
        )
        .unwrap();
        assert!(matches!(
            load_roles(dir.path()),
            Err(ConfigError::ValidationError { .. })
        ));
    }
}
