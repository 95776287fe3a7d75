use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use wait_timeout::ChildExt;

/// Verifies a commit's detached signature and names the signing key.
pub trait SignatureVerifier {
    /// Lowercase hex fingerprint of the primary key that produced a valid
    /// signature over `payload`.
    fn verify(&self, payload: &[u8], signature: &str) -> Result<String>;
}

/// `gpg`-backed verifier. The run keyring is imported once into a private
/// homedir which lives as long as the verifier; nothing touches the
/// user's own keyring.
pub struct GpgVerifier {
    program: String,
    base_args: Vec<String>,
    homedir: tempfile::TempDir,
    timeout: Duration,
}

impl GpgVerifier {
    pub fn new(command: &str, keyring: &str) -> Result<Self> {
        let (program, base_args) = split_command_line(command)?;
        let homedir = tempfile::Builder::new()
            .prefix("gitwarden-gnupg-")
            .tempdir()
            .context("failed to create gnupg homedir")?;
        let verifier = Self {
            program,
            base_args,
            homedir,
            timeout: Duration::from_secs(30),
        };
        verifier.import(keyring)?;
        Ok(verifier)
    }

    fn import(&self, keyring: &str) -> Result<()> {
        let path = self.homedir.path().join("keyring.asc");
        std::fs::write(&path, keyring)
            .with_context(|| format!("failed to write {}", path.display()))?;

        let out = self
            .command()
            .arg("--import")
            .arg(&path)
            .output()
            .with_context(|| format!("failed to spawn {}", self.program))?;
        if !out.status.success() {
            return Err(anyhow!(
                "importing keyring failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ));
        }
        Ok(())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args);
        cmd.arg("--homedir").arg(self.homedir.path());
        cmd.args(["--batch", "--no-tty", "--status-fd", "1"]);
        cmd
    }
}

impl SignatureVerifier for GpgVerifier {
    fn verify(&self, payload: &[u8], signature: &str) -> Result<String> {
        let sig_path = self.homedir.path().join("commit.sig");
        let payload_path = self.homedir.path().join("commit.payload");
        std::fs::write(&sig_path, format!("{signature}\n"))
            .with_context(|| format!("failed to write {}", sig_path.display()))?;
        std::fs::write(&payload_path, payload)
            .with_context(|| format!("failed to write {}", payload_path.display()))?;

        let mut child = self
            .command()
            .arg("--verify")
            .arg(&sig_path)
            .arg(&payload_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;

        let stdout_handle = child.stdout.take().map(read_to_end_thread);
        let stderr_handle = child.stderr.take().map(read_to_end_thread);

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!(
                    "{} timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                ));
            }
        };

        let stdout = stdout_handle
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();
        let stderr = stderr_handle
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();

        if !status.success() {
            return Err(anyhow!(
                "signature did not verify: {}",
                first_meaningful_line(&stderr).unwrap_or("no details from gpg")
            ));
        }

        parse_validsig(&stdout)
            .ok_or_else(|| anyhow!("{} reported no valid signature", self.program))
    }
}

/// The last field of a `VALIDSIG` status line is the primary key
/// fingerprint; the commit is attributed to the key holder, not to
/// whichever subkey signed.
fn parse_validsig(status: &str) -> Option<String> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("[GNUPG:] VALIDSIG ") {
            let fingerprint = rest.split_whitespace().last()?;
            return Some(fingerprint.to_ascii_lowercase());
        }
    }
    None
}

fn first_meaningful_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

fn read_to_end_thread(
    mut reader: impl std::io::Read + Send + 'static,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn split_command_line(input: &str) -> Result<(String, Vec<String>)> {
    let parts = shlex::split(input).ok_or_else(|| anyhow!("invalid gpg command: {input}"))?;
    if parts.is_empty() {
        return Err(anyhow!("gpg command is empty"));
    }
    let mut parts_iter = parts.into_iter();
    let program = parts_iter.next().unwrap();
    Ok((program, parts_iter.collect()))
}
