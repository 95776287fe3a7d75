use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

/// Conventional CODEOWNERS locations, tried in order.
const LOCATIONS: &[&str] = &["CODEOWNERS", ".github/CODEOWNERS", "docs/CODEOWNERS"];

/// Path-to-owners resolution. Pattern matching is delegated to the
/// CODEOWNERS parser; owners come back as the literal tokens written in
/// the policy file (`@user`, `@org/team`, or an email address).
pub struct CodeOwners {
    inner: codeowners::Owners,
}

impl std::fmt::Debug for CodeOwners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeOwners").finish_non_exhaustive()
    }
}

impl CodeOwners {
    /// Loads the repository's CODEOWNERS file from its conventional
    /// location.
    pub fn discover(root: &Path) -> Result<Self> {
        for location in LOCATIONS {
            let path = root.join(location);
            if path.exists() {
                return Self::load(&path);
            }
        }
        Err(anyhow!(
            "no CODEOWNERS file found under {} (tried {})",
            root.display(),
            LOCATIONS.join(", ")
        ))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self {
            inner: codeowners::from_reader(BufReader::new(file)),
        })
    }

    #[cfg(test)]
    pub(crate) fn parse(content: &str) -> Self {
        Self {
            inner: codeowners::from_reader(content.as_bytes()),
        }
    }

    /// Owner tokens for a path, in policy order. `None` means no rule
    /// covers the path: it is unrestricted.
    pub fn owners_of(&self, path: &str) -> Option<Vec<String>> {
        self.inner
            .of(path)
            .map(|owners| owners.iter().map(ToString::to_string).collect())
    }
}
