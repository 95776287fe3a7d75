mod config;
mod git;
mod gpg;
mod keyring;
mod owners;
mod registry;
mod walker;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use crate::config::{Config, FileConfig, Overrides};
use crate::git::{Commit, Git, GitRepo};
use crate::gpg::GpgVerifier;
use crate::keyring::{HttpFetcher, KeyringSource};
use crate::owners::CodeOwners;
use crate::registry::{FingerprintRegistry, TrustedCommits, UsernameMap};
use crate::walker::{WalkOutcome, Walker};

#[derive(Parser, Debug)]
#[command(
    name = "gitwarden",
    version,
    about = "Verifies that every commit touching an owned file was signed by one of its owners"
)]
struct Cli {
    /// Path to the git repository
    #[arg(long, default_value = ".")]
    repository: PathBuf,

    /// Path to a file containing an existing armored keyring
    #[arg(long)]
    keyring: Option<PathBuf>,

    /// Base URL of a forge instance for building the keyring
    #[arg(long)]
    remote_base: Option<String>,

    /// Fingerprint registry file [default: <repository>/CODEOWNERS_FINGERPRINTS]
    #[arg(long)]
    fingerprints: Option<PathBuf>,

    /// Trusted-commit file ending the walk [default: <repository>/TRUSTED_COMMITS]
    #[arg(long)]
    trusted: Option<PathBuf>,

    /// Identity-to-username map for remote key fetches [default: <repository>/CODEOWNERS_USERNAMES]
    #[arg(long)]
    usernames: Option<PathBuf>,

    /// Do not try to validate merge commits
    #[arg(long)]
    ignore_merge: bool,

    /// gpg command used for signature verification
    #[arg(long)]
    gpg: Option<String>,

    /// Logging level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    ExitCode::from(run())
}

fn run() -> u8 {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.clone())
        .with_writer(std::io::stderr)
        .init();

    match try_run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            1
        }
    }
}

fn try_run(cli: Cli) -> Result<u8> {
    let overrides = Overrides {
        keyring: cli.keyring,
        remote_base: cli.remote_base,
        fingerprints: cli.fingerprints,
        trusted_commits: cli.trusted,
        usernames: cli.usernames,
        ignore_merge: cli.ignore_merge,
        gpg: cli.gpg,
    };
    let file = FileConfig::load(&cli.repository)?;
    let config = Config::resolve(cli.repository, overrides, file)?;

    let repo = GitRepo::open(&config.repository)?;
    let git = Git::new(repo);

    let Some(head) = git.head().context("failed to resolve HEAD")? else {
        info!("repository has no commits, nothing to verify");
        return Ok(0);
    };
    info!(head = %head, "head resolved");

    let history = walker::collect_history(&git, &head)?;
    info!(commits = history.len(), "history materialized");

    let trusted = match &config.trusted_commits {
        Some(path) => TrustedCommits::load(path)?,
        None => TrustedCommits::default(),
    };
    let registry = FingerprintRegistry::load(&config.fingerprints)?;
    let owners = CodeOwners::discover(&config.repository)?;

    let armored = build_run_keyring(&config, &history, &trusted)?;
    let verifier = GpgVerifier::new(&config.gpg, &armored)?;

    let walker = Walker {
        verifier: &verifier,
        diff: &git,
        owners: &owners,
        registry: &registry,
        trusted: &trusted,
        ignore_merges: config.ignore_merge,
    };

    match walker.walk(&history)? {
        WalkOutcome::Clean { checked } => {
            info!(checked, "verification complete, all commits pass");
            Ok(0)
        }
        WalkOutcome::TrustBoundary { commit, checked } => {
            info!(checked, commit = %commit, "verification complete up to trusted commit");
            Ok(0)
        }
        WalkOutcome::Violation(violation) => {
            error!("{violation}");
            Ok(2)
        }
    }
}

/// The keyring is assembled in full before the walk begins; any failure
/// here aborts the run.
fn build_run_keyring(
    config: &Config,
    history: &[Commit],
    trusted: &TrustedCommits,
) -> Result<String> {
    match &config.source {
        KeyringSource::File(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read keyring {}", path.display())),
        KeyringSource::Remote { base_url } => {
            let fetcher = HttpFetcher::new(base_url)?;
            match &config.usernames {
                Some(path) => {
                    let map = UsernameMap::load(path)?;
                    keyring::assemble_from_usernames(&fetcher, &map)
                }
                None => {
                    let emails =
                        walker::committer_emails(history, trusted, config.ignore_merge);
                    keyring::assemble_from_emails(&fetcher, &emails)
                }
            }
        }
    }
}
