use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

/// Reads the meaningful lines of a flat policy file. Blank lines and
/// `#`-prefixed comments are ignored.
fn policy_lines(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn split_pair<'a>(line: &'a str, path: &Path) -> Result<(&'a str, &'a str)> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(first), Some(second), None) => Ok((first, second)),
        _ => Err(anyhow!(
            "malformed entry in {}: expected two fields, got {line:?}",
            path.display()
        )),
    }
}

/// Authoritative identity-to-fingerprint table. An owner identity that is
/// missing here is a broken policy file, never a failed match.
#[derive(Debug, Clone, Default)]
pub struct FingerprintRegistry {
    entries: BTreeMap<String, String>,
}

impl FingerprintRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for line in policy_lines(path)? {
            let (identity, fingerprint) = split_pair(&line, path)?;
            let fingerprint = fingerprint.to_ascii_lowercase();
            validate_fingerprint(&fingerprint).with_context(|| {
                format!("bad fingerprint for {identity} in {}", path.display())
            })?;
            entries.insert(identity.to_string(), fingerprint);
        }
        Ok(Self { entries })
    }

    #[cfg(test)]
    pub(crate) fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Expected key fingerprint for an identity, lowercase hex.
    pub fn fingerprint_of(&self, identity: &str) -> Option<&str> {
        self.entries.get(identity).map(String::as_str)
    }
}

fn validate_fingerprint(fingerprint: &str) -> Result<()> {
    let bytes = hex::decode(fingerprint).context("fingerprint is not hex")?;
    if bytes.len() != 20 {
        return Err(anyhow!(
            "fingerprint must be 40 hex characters, got {}",
            fingerprint.len()
        ));
    }
    Ok(())
}

/// Ordered set of commit ids beyond which verification is not required.
/// Reaching any of them halts the walk.
#[derive(Debug, Clone, Default)]
pub struct TrustedCommits {
    ids: Vec<String>,
}

impl TrustedCommits {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            ids: policy_lines(path)?,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|entry| entry == id)
    }
}

/// Identity-to-platform-username map used when assembling the keyring from
/// a remote forge. Iteration order is the file's line order.
#[derive(Debug, Clone, Default)]
pub struct UsernameMap {
    entries: Vec<(String, String)>,
}

impl UsernameMap {
    pub fn load(path: &Path) -> Result<Self> {
        let mut entries = Vec::new();
        for line in policy_lines(path)? {
            let (identity, username) = split_pair(&line, path)?;
            entries.push((identity.to_string(), username.to_string()));
        }
        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(identity, username)| (identity.as_str(), username.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn registry_parses_pairs_and_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "CODEOWNERS_FINGERPRINTS",
            "# comment\n\n@alice 9cf35828cec50de0294e04a1c645433b1e5e7a65\n\
             bob@example.com 5ea8af38993138b5164451434b453ad9fd3993bd\n",
        );

        let registry = FingerprintRegistry::load(&path).unwrap();
        assert_eq!(
            registry.fingerprint_of("@alice"),
            Some("9cf35828cec50de0294e04a1c645433b1e5e7a65")
        );
        assert_eq!(
            registry.fingerprint_of("bob@example.com"),
            Some("5ea8af38993138b5164451434b453ad9fd3993bd")
        );
        assert_eq!(registry.fingerprint_of("@carol"), None);
    }

    #[test]
    fn registry_normalizes_fingerprint_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "CODEOWNERS_FINGERPRINTS",
            "@alice 9CF35828CEC50DE0294E04A1C645433B1E5E7A65\n",
        );

        let registry = FingerprintRegistry::load(&path).unwrap();
        assert_eq!(
            registry.fingerprint_of("@alice"),
            Some("9cf35828cec50de0294e04a1c645433b1e5e7a65")
        );
    }

    #[test]
    fn registry_rejects_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "CODEOWNERS_FINGERPRINTS", "@alice\n");
        let err = FingerprintRegistry::load(&path).unwrap_err();
        assert!(err.to_string().contains("expected two fields"), "{err:#}");
    }

    #[test]
    fn registry_rejects_short_or_non_hex_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let short = write_file(&dir, "short", "@alice 9cf358\n");
        assert!(FingerprintRegistry::load(&short).is_err());

        let junk = write_file(
            &dir,
            "junk",
            "@alice zzf35828cec50de0294e04a1c645433b1e5e7a65\n",
        );
        assert!(FingerprintRegistry::load(&junk).is_err());
    }

    #[test]
    fn trusted_commits_membership() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "TRUSTED_COMMITS",
            "# known-good release tags\n5ea8af38993138b5164451434b453ad9fd3993bd\n",
        );

        let trusted = TrustedCommits::load(&path).unwrap();
        assert!(trusted.contains("5ea8af38993138b5164451434b453ad9fd3993bd"));
        assert!(!trusted.contains("9cf35828cec50de0294e04a1c645433b1e5e7a65"));
    }

    #[test]
    fn username_map_preserves_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "CODEOWNERS_USERNAMES",
            "bob@example.com bob\nalice@example.com alice\n",
        );

        let map = UsernameMap::load(&path).unwrap();
        let entries: Vec<_> = map.iter().collect();
        assert_eq!(
            entries,
            vec![("bob@example.com", "bob"), ("alice@example.com", "alice")]
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope");
        assert!(FingerprintRegistry::load(&path).is_err());
        assert!(TrustedCommits::load(&path).is_err());
        assert!(UsernameMap::load(&path).is_err());
    }
}
