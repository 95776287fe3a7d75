use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::keyring::KeyringSource;

pub const CONFIG_FILE: &str = ".gitwarden.toml";
pub const DEFAULT_FINGERPRINTS: &str = "CODEOWNERS_FINGERPRINTS";
pub const DEFAULT_TRUSTED: &str = "TRUSTED_COMMITS";
pub const DEFAULT_USERNAMES: &str = "CODEOWNERS_USERNAMES";

/// Defaults read from `.gitwarden.toml` in the repository working tree.
/// Every field is optional; the command line overrides all of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub keyring: Option<PathBuf>,
    #[serde(default)]
    pub remote_base: Option<String>,
    #[serde(default)]
    pub fingerprints: Option<PathBuf>,
    #[serde(default)]
    pub trusted_commits: Option<PathBuf>,
    #[serde(default)]
    pub usernames: Option<PathBuf>,
    #[serde(default)]
    pub ignore_merge: Option<bool>,
    #[serde(default)]
    pub gpg: Option<String>,
}

impl FileConfig {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// Command line values layered over the file defaults.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub keyring: Option<PathBuf>,
    pub remote_base: Option<String>,
    pub fingerprints: Option<PathBuf>,
    pub trusted_commits: Option<PathBuf>,
    pub usernames: Option<PathBuf>,
    pub ignore_merge: bool,
    pub gpg: Option<String>,
}

/// The resolved run configuration, fixed before any repository access and
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub repository: PathBuf,
    pub source: KeyringSource,
    pub fingerprints: PathBuf,
    /// `None` when no trusted-commit file is present: an empty boundary,
    /// the walk runs to the root of history.
    pub trusted_commits: Option<PathBuf>,
    /// `None` when no username map is configured or present; remote
    /// keyring assembly then falls back to committer emails.
    pub usernames: Option<PathBuf>,
    pub ignore_merge: bool,
    pub gpg: String,
}

impl Config {
    pub fn resolve(repository: PathBuf, cli: Overrides, file: FileConfig) -> Result<Self> {
        let source = match (
            cli.keyring.or(file.keyring),
            cli.remote_base.or(file.remote_base),
        ) {
            (Some(path), None) => KeyringSource::File(path),
            (None, Some(base_url)) => KeyringSource::Remote { base_url },
            (Some(_), Some(_)) => {
                return Err(anyhow!("--keyring and --remote-base are mutually exclusive"))
            }
            (None, None) => {
                return Err(anyhow!(
                    "no keyring source: specify --keyring <file> or --remote-base <url>"
                ))
            }
        };

        let fingerprints = cli
            .fingerprints
            .or(file.fingerprints)
            .unwrap_or_else(|| repository.join(DEFAULT_FINGERPRINTS));
        let trusted_commits = explicit_or_default(
            cli.trusted_commits.or(file.trusted_commits),
            &repository,
            DEFAULT_TRUSTED,
        )?;
        let usernames =
            explicit_or_default(cli.usernames.or(file.usernames), &repository, DEFAULT_USERNAMES)?;

        Ok(Self {
            repository,
            source,
            fingerprints,
            trusted_commits,
            usernames,
            ignore_merge: cli.ignore_merge || file.ignore_merge.unwrap_or(false),
            gpg: cli.gpg.or(file.gpg).unwrap_or_else(|| "gpg".to_string()),
        })
    }
}

/// An explicitly configured file must exist; the conventional default is
/// picked up only when present.
fn explicit_or_default(
    explicit: Option<PathBuf>,
    repository: &Path,
    default_name: &str,
) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(anyhow!("{} does not exist", path.display()));
            }
            Ok(Some(path))
        }
        None => {
            let path = repository.join(default_name);
            Ok(path.exists().then_some(path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides_with_keyring() -> Overrides {
        Overrides {
            keyring: Some(PathBuf::from("ring.asc")),
            ..Overrides::default()
        }
    }

    #[test]
    fn requires_exactly_one_keyring_source() {
        let dir = tempfile::tempdir().unwrap();

        let neither = Config::resolve(
            dir.path().to_path_buf(),
            Overrides::default(),
            FileConfig::default(),
        );
        assert!(neither.unwrap_err().to_string().contains("keyring source"));

        let both = Config::resolve(
            dir.path().to_path_buf(),
            Overrides {
                keyring: Some(PathBuf::from("ring.asc")),
                remote_base: Some("https://forge.example.com".to_string()),
                ..Overrides::default()
            },
            FileConfig::default(),
        );
        assert!(both
            .unwrap_err()
            .to_string()
            .contains("mutually exclusive"));
    }

    #[test]
    fn file_config_supplies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "remote_base = \"https://forge.example.com\"\nignore_merge = true\n",
        )
        .unwrap();

        let file = FileConfig::load(dir.path()).unwrap();
        let config =
            Config::resolve(dir.path().to_path_buf(), Overrides::default(), file).unwrap();

        assert!(matches!(
            config.source,
            KeyringSource::Remote { ref base_url } if base_url == "https://forge.example.com"
        ));
        assert!(config.ignore_merge);
        assert_eq!(config.gpg, "gpg");
    }

    #[test]
    fn command_line_overrides_file_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "gpg = \"gpg2\"\n").unwrap();

        let file = FileConfig::load(dir.path()).unwrap();
        let config = Config::resolve(
            dir.path().to_path_buf(),
            Overrides {
                gpg: Some("gpg1".to_string()),
                ..overrides_with_keyring()
            },
            file,
        )
        .unwrap();
        assert_eq!(config.gpg, "gpg1");
    }

    #[test]
    fn default_policy_files_are_optional() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::resolve(
            dir.path().to_path_buf(),
            overrides_with_keyring(),
            FileConfig::default(),
        )
        .unwrap();
        assert!(config.trusted_commits.is_none());
        assert!(config.usernames.is_none());
        // The registry is always required; its default path is used even
        // when the file does not exist yet, so the loader can name it.
        assert_eq!(
            config.fingerprints,
            dir.path().join(DEFAULT_FINGERPRINTS)
        );
    }

    #[test]
    fn present_default_files_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_TRUSTED), "").unwrap();

        let config = Config::resolve(
            dir.path().to_path_buf(),
            overrides_with_keyring(),
            FileConfig::default(),
        )
        .unwrap();
        assert_eq!(
            config.trusted_commits,
            Some(dir.path().join(DEFAULT_TRUSTED))
        );
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::resolve(
            dir.path().to_path_buf(),
            Overrides {
                trusted_commits: Some(dir.path().join("nope")),
                ..overrides_with_keyring()
            },
            FileConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "ignore_merge = \"yes\"\n").unwrap();
        assert!(FileConfig::load(dir.path()).is_err());
    }
}
