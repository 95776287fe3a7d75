use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};

/// One commit as read from the object store.
#[derive(Debug, Clone)]
pub struct Commit {
    pub id: String,
    /// Tree snapshot id for this commit.
    pub tree: String,
    pub parents: Vec<String>,
    pub author: String,
    pub committer: String,
    pub committer_email: String,
    /// Armored detached signature, when the commit carries one.
    pub signature: Option<String>,
    /// The signable content: the raw commit object with the signature
    /// header removed, byte for byte.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct GitRepo {
    pub workdir: PathBuf,
}

impl GitRepo {
    pub fn open(path: &Path) -> Result<Self> {
        let out = Command::new("git")
            .arg("-C")
            .arg(path)
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .context("failed to run git")?;
        if !out.status.success() {
            return Err(anyhow!("{} is not a git repository", path.display()));
        }
        let workdir = PathBuf::from(String::from_utf8(out.stdout)?.trim());
        Ok(Self { workdir })
    }
}

#[derive(Debug, Clone)]
pub struct Git {
    pub repo: GitRepo,
}

impl Git {
    pub fn new(repo: GitRepo) -> Self {
        Self { repo }
    }

    /// Commit id of HEAD, or `None` for a repository with no commits.
    pub fn head(&self) -> Result<Option<String>> {
        let out = Command::new("git")
            .current_dir(&self.repo.workdir)
            .args(["rev-parse", "--quiet", "--verify", "HEAD"])
            .output()
            .context("failed to run git")?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8(out.stdout)?.trim().to_string()))
    }

    pub fn read_commit(&self, id: &str) -> Result<Commit> {
        let raw = self.git_output_bytes(["cat-file", "commit", id])?;
        parse_commit(id, &raw).with_context(|| format!("failed to parse commit {id}"))
    }

    /// Paths whose content or presence differs between two tree snapshots.
    pub fn diff_trees(&self, old_tree: &str, new_tree: &str) -> Result<Vec<String>> {
        let out = self.git_output(["diff-tree", "-r", "--name-only", old_tree, new_tree])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn git_output<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        Ok(String::from_utf8(self.git_output_bytes(args)?)?)
    }

    fn git_output_bytes<I, S>(&self, args: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let out = Command::new("git")
            .current_dir(&self.repo.workdir)
            .args(args)
            .output()
            .context("failed to run git")?;
        if !out.status.success() {
            return Err(anyhow!(
                "git command failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(out.stdout)
    }
}

/// Parses a raw commit object into its metadata, detached signature, and
/// signable payload. The payload must be byte-identical to what the key
/// holder signed, so the signature header (including its continuation
/// lines and trailing newline) is excised from the raw bytes rather than
/// re-serialized.
pub fn parse_commit(id: &str, raw: &[u8]) -> Result<Commit> {
    let header_end = raw
        .windows(2)
        .position(|w| w == b"\n\n")
        .ok_or_else(|| anyhow!("commit object has no header terminator"))?;
    let header = &raw[..header_end];

    // Header lines with their byte offsets; the last line of the slice is
    // unterminated (its newline sits at `header_end`).
    let mut lines: Vec<(usize, &[u8])> = Vec::new();
    let mut start = 0;
    for (i, &b) in header.iter().enumerate() {
        if b == b'\n' {
            lines.push((start, &header[start..i]));
            start = i + 1;
        }
    }
    lines.push((start, &header[start..]));

    let mut tree = None;
    let mut parents = Vec::new();
    let mut author = None;
    let mut committer = None;
    let mut signature = None;
    let mut signature_range = None;

    let mut i = 0;
    while i < lines.len() {
        let (offset, line) = lines[i];
        let text = String::from_utf8_lossy(line);
        let (key, value) = match text.split_once(' ') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (text.to_string(), String::new()),
        };

        // Continuation lines (leading space) belong to the current header.
        let mut continuation = Vec::new();
        let mut j = i + 1;
        while j < lines.len() && lines[j].1.first() == Some(&b' ') {
            continuation.push(String::from_utf8_lossy(&lines[j].1[1..]).to_string());
            j += 1;
        }
        let end = if j < lines.len() {
            lines[j].0
        } else {
            header_end + 1
        };

        match key.as_str() {
            "tree" => tree = Some(value),
            "parent" => parents.push(value),
            "author" => author = Some(value),
            "committer" => committer = Some(value),
            "gpgsig" => {
                let mut sig = value;
                for line in continuation {
                    sig.push('\n');
                    sig.push_str(&line);
                }
                signature = Some(sig);
                signature_range = Some((offset, end));
            }
            _ => {}
        }
        i = j;
    }

    let payload = match signature_range {
        Some((start, end)) => [&raw[..start], &raw[end..]].concat(),
        None => raw.to_vec(),
    };

    let committer = committer.ok_or_else(|| anyhow!("commit has no committer header"))?;
    let committer_email = email_of(&committer).unwrap_or_default();

    Ok(Commit {
        id: id.to_string(),
        tree: tree.ok_or_else(|| anyhow!("commit has no tree header"))?,
        parents,
        author: author.ok_or_else(|| anyhow!("commit has no author header"))?,
        committer,
        committer_email,
        signature,
        payload,
    })
}

/// Email address out of an `author`/`committer` header value.
fn email_of(identity: &str) -> Option<String> {
    let start = identity.find('<')? + 1;
    let end = identity[start..].find('>')? + start;
    Some(identity[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNSIGNED: &str = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                            parent 5ea8af38993138b5164451434b453ad9fd3993bd\n\
                            author A U Thor <author@example.com> 1700000000 +0000\n\
                            committer C O Mitter <committer@example.com> 1700000000 +0000\n\
                            \n\
                            add a file\n";

    #[test]
    fn parses_unsigned_commit() {
        let commit = parse_commit("abc123", UNSIGNED.as_bytes()).unwrap();
        assert_eq!(commit.id, "abc123");
        assert_eq!(commit.tree, "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
        assert_eq!(
            commit.parents,
            vec!["5ea8af38993138b5164451434b453ad9fd3993bd".to_string()]
        );
        assert_eq!(commit.committer_email, "committer@example.com");
        assert!(commit.signature.is_none());
        assert_eq!(commit.payload, UNSIGNED.as_bytes());
    }

    #[test]
    fn extracts_signature_and_signable_payload() {
        let signed = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                      author A U Thor <author@example.com> 1700000000 +0000\n\
                      committer C O Mitter <committer@example.com> 1700000000 +0000\n\
                      gpgsig -----BEGIN PGP SIGNATURE-----\n\
                      \x20\n\
                      \x20bW9jaw==\n\
                      \x20-----END PGP SIGNATURE-----\n\
                      \n\
                      root commit\n";
        let unsigned = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                        author A U Thor <author@example.com> 1700000000 +0000\n\
                        committer C O Mitter <committer@example.com> 1700000000 +0000\n\
                        \n\
                        root commit\n";

        let commit = parse_commit("abc123", signed.as_bytes()).unwrap();
        assert_eq!(
            commit.signature.as_deref(),
            Some("-----BEGIN PGP SIGNATURE-----\n\nbW9jaw==\n-----END PGP SIGNATURE-----")
        );
        // The payload is the commit object as if the signature header had
        // never been added.
        assert_eq!(commit.payload, unsigned.as_bytes());
        assert!(commit.parents.is_empty());
    }

    #[test]
    fn signature_between_headers_is_excised() {
        let signed = "tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\n\
                      author A U Thor <author@example.com> 1700000000 +0000\n\
                      gpgsig -----BEGIN PGP SIGNATURE-----\n\
                      \x20abc\n\
                      \x20-----END PGP SIGNATURE-----\n\
                      committer C O Mitter <committer@example.com> 1700000000 +0000\n\
                      \n\
                      msg\n";
        let commit = parse_commit("abc123", signed.as_bytes()).unwrap();
        assert_eq!(commit.committer_email, "committer@example.com");
        let payload = String::from_utf8(commit.payload).unwrap();
        assert!(!payload.contains("gpgsig"));
        assert!(payload.contains("committer C O Mitter"));
    }

    #[test]
    fn rejects_truncated_object() {
        assert!(parse_commit("abc123", b"tree deadbeef").is_err());
    }

    #[test]
    fn email_extraction() {
        assert_eq!(
            email_of("C O Mitter <committer@example.com> 1700000000 +0000"),
            Some("committer@example.com".to_string())
        );
        assert_eq!(email_of("no email here"), None);
    }
}
