use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use crate::git::{Commit, Git};
use crate::gpg::SignatureVerifier;
use crate::owners::CodeOwners;
use crate::registry::{FingerprintRegistry, TrustedCommits};

/// Reads commit objects by id. The walker follows parent links through
/// this seam so history can be faked in tests.
pub trait CommitSource {
    fn commit(&self, id: &str) -> Result<Commit>;
}

impl CommitSource for Git {
    fn commit(&self, id: &str) -> Result<Commit> {
        self.read_commit(id)
    }
}

/// Computes the set of paths differing between two tree snapshots.
pub trait TreeDiff {
    fn changed_paths(&self, old_tree: &str, new_tree: &str) -> Result<Vec<String>>;
}

impl TreeDiff for Git {
    fn changed_paths(&self, old_tree: &str, new_tree: &str) -> Result<Vec<String>> {
        self.diff_trees(old_tree, new_tree)
    }
}

/// Materializes the commits reachable from `head` in breadth-first order,
/// children before grandparents. Each commit's change set is computed
/// against the tree of the commit visited immediately before it, so this
/// order is load-bearing: changing it changes verification results.
///
/// The returned sequence is finite and reusable; committer collection for
/// remote keyring assembly and the verification walk both read it, and
/// history is never iterated twice.
pub fn collect_history(source: &dyn CommitSource, head: &str) -> Result<Vec<Commit>> {
    let mut order = Vec::new();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([head.to_string()]);

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let commit = source
            .commit(&id)
            .with_context(|| format!("reading commit {id}"))?;
        queue.extend(commit.parents.iter().cloned());
        order.push(commit);
    }

    Ok(order)
}

/// Committer identities inside the walked range. The trust boundary and
/// the merge exclusion apply exactly as they do during verification, so
/// keys are fetched for precisely the commits that will be checked.
pub fn committer_emails(
    history: &[Commit],
    trusted: &TrustedCommits,
    ignore_merges: bool,
) -> BTreeSet<String> {
    let mut emails = BTreeSet::new();
    for commit in history {
        if ignore_merges && commit.parents.len() > 1 {
            continue;
        }
        if trusted.contains(&commit.id) {
            break;
        }
        if !commit.committer_email.is_empty() {
            emails.insert(commit.committer_email.clone());
        }
    }
    emails
}

/// Terminal outcome of a walk that completed without input errors.
#[derive(Debug)]
pub enum WalkOutcome {
    /// Every commit down to the root of history passed.
    Clean { checked: usize },
    /// The walk stopped at an explicitly trusted commit; everything
    /// beyond it is implicitly trusted.
    TrustBoundary { commit: String, checked: usize },
    /// The first trust violation found. Nothing past it was examined.
    Violation(Violation),
}

#[derive(Debug)]
pub enum Violation {
    /// The signature was missing or did not verify against the keyring.
    BadSignature { commit: String, reason: String },
    /// A changed file is owned and the signer is not one of its owners.
    UnauthorizedChange {
        commit: String,
        path: String,
        signer: String,
        owners: Vec<String>,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::BadSignature { commit, reason } => {
                write!(f, "commit {commit}: {reason}")
            }
            Violation::UnauthorizedChange {
                commit,
                path,
                signer,
                owners,
            } => write!(
                f,
                "commit {commit}: {path} is owned by {} and signing key {signer} belongs to none of them",
                owners.join(", ")
            ),
        }
    }
}

/// Drives one verification pass per commit over a materialized history.
pub struct Walker<'a> {
    pub verifier: &'a dyn SignatureVerifier,
    pub diff: &'a dyn TreeDiff,
    pub owners: &'a CodeOwners,
    pub registry: &'a FingerprintRegistry,
    pub trusted: &'a TrustedCommits,
    pub ignore_merges: bool,
}

impl Walker<'_> {
    pub fn walk(&self, history: &[Commit]) -> Result<WalkOutcome> {
        let mut previous_tree: Option<&str> = None;
        let mut checked = 0;

        for commit in history {
            // A skipped merge still counts as visited, but leaves the
            // previous-tree pointer untouched: the next commit diffs
            // against the last non-merge tree.
            if self.ignore_merges && commit.parents.len() > 1 {
                debug!(commit = %commit.id, parents = commit.parents.len(), "skipping merge commit");
                continue;
            }

            if self.trusted.contains(&commit.id) {
                info!(commit = %commit.id, "reached trusted commit, stopping walk");
                return Ok(WalkOutcome::TrustBoundary {
                    commit: commit.id.clone(),
                    checked,
                });
            }

            info!(commit = %commit.id, "examining commit");
            debug!(author = %commit.author, committer = %commit.committer, "commit identities");

            let signer = match self.verify_signature(commit) {
                Ok(fingerprint) => fingerprint,
                Err(reason) => {
                    return Ok(WalkOutcome::Violation(Violation::BadSignature {
                        commit: commit.id.clone(),
                        reason,
                    }));
                }
            };
            debug!(commit = %commit.id, signer = %signer, "signature verified");

            // The first non-skipped commit has nothing to diff against and
            // is exempt from ownership checking.
            if let Some(previous) = previous_tree {
                let changed = self
                    .diff
                    .changed_paths(previous, &commit.tree)
                    .with_context(|| format!("diffing trees of commit {}", commit.id))?;
                if let Some(violation) = self.check_changes(commit, &signer, &changed)? {
                    return Ok(WalkOutcome::Violation(violation));
                }
            }

            previous_tree = Some(&commit.tree);
            checked += 1;
        }

        Ok(WalkOutcome::Clean { checked })
    }

    fn verify_signature(&self, commit: &Commit) -> std::result::Result<String, String> {
        let Some(signature) = &commit.signature else {
            return Err("commit is not signed".to_string());
        };
        self.verifier
            .verify(&commit.payload, signature)
            .map_err(|err| format!("{err:#}"))
    }

    /// The decision engine: a path with no owners is unrestricted; an
    /// owned path is satisfied if the signer matches any one owner's
    /// registered fingerprint. One unsatisfied path rejects the commit.
    fn check_changes(
        &self,
        commit: &Commit,
        signer: &str,
        changed: &[String],
    ) -> Result<Option<Violation>> {
        for path in changed {
            let owners = match self.owners.owners_of(path) {
                Some(owners) if !owners.is_empty() => owners,
                _ => {
                    debug!(commit = %commit.id, path = %path, "no owners, unrestricted");
                    continue;
                }
            };

            // Resolve every owner before comparing: an unregistered owner
            // is a broken policy file, not a failed match, and aborts the
            // run even when another owner would have matched.
            let mut expected = Vec::with_capacity(owners.len());
            for owner in &owners {
                let fingerprint = self.registry.fingerprint_of(owner).ok_or_else(|| {
                    anyhow!("owner {owner} of {path} has no registered fingerprint")
                })?;
                expected.push(fingerprint);
            }

            if expected.iter().any(|fingerprint| *fingerprint == signer) {
                debug!(commit = %commit.id, path = %path, "signer is an owner");
                continue;
            }

            return Ok(Some(Violation::UnauthorizedChange {
                commit: commit.id.clone(),
                path: path.clone(),
                signer: signer.to_string(),
                owners,
            }));
        }
        Ok(None)
    }
}
