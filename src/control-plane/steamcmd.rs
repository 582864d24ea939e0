use std::collections::VecDeque;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::consts::*;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::lock::UpdateLock;

lazy_static! {
    /// e.g. `Update state (0x61) downloading, progress: 42.17 (1234 / 5678)`
    static ref UPDATE_STATE_RE: Regex =
        Regex::new(r"Update state \(0x[0-9a-fA-F]+\) ([a-z ]+), progress: ([0-9.]+)").unwrap();
}

pub type ProgressFn<'a> = &'a (dyn Fn(u8, String) + Send + Sync);

/// Locates, installs and drives SteamCMD. All binary writes happen under the
/// process-wide update lock.
pub struct SteamCmd {
    layout: Arc<Layout>,
    lock: Arc<UpdateLock>,
    /// Optional operator-provided location, searched before the managed one.
    configured_path: Option<PathBuf>,
}

impl SteamCmd {
    pub fn new(layout: Arc<Layout>, lock: Arc<UpdateLock>, configured_path: Option<PathBuf>) -> SteamCmd {
        SteamCmd {
            layout,
            lock,
            configured_path,
        }
    }

    fn exe_name() -> &'static str {
        if cfg!(windows) {
            "steamcmd.exe"
        } else {
            "steamcmd.sh"
        }
    }

    /// Returns the SteamCMD executable if present in any search location.
    pub fn locate(&self) -> Option<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(configured) = &self.configured_path {
            candidates.push(configured.clone());
            candidates.push(configured.join(SteamCmd::exe_name()));
        }
        candidates.push(self.layout.steamcmd_dir().join(SteamCmd::exe_name()));

        candidates.into_iter().find(|p| p.is_file())
    }

    pub fn is_installed(&self) -> bool {
        self.locate().is_some()
    }

    /// Locates an existing SteamCMD or downloads the installer archive from
    /// the Steam CDN, extracts it and runs it once to self-update. Returns
    /// the absolute executable path.
    pub async fn ensure_installed(&self, foreground: bool) -> Result<PathBuf> {
        if let Some(exe) = self.locate() {
            debug!("found existing SteamCMD at {}", exe.display());
            return Ok(exe);
        }

        let install_dir = self.layout.steamcmd_dir();
        tokio::fs::create_dir_all(&install_dir).await?;

        info!("downloading SteamCMD from {}", STEAMCMD_DOWNLOAD_URL);
        let response = reqwest::get(STEAMCMD_DOWNLOAD_URL)
            .await?
            .error_for_status()
            .map_err(|e| Error::DownloadFailed(format!("SteamCMD download failed: {}", e)))?;
        let bytes: bytes::Bytes = response.bytes().await?;

        info!("extracting SteamCMD to {}", install_dir.display());
        let target = install_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
            archive.extract(&target)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("extract task failed: {}", e)))??;

        let exe = install_dir.join(SteamCmd::exe_name());
        if !exe.is_file() {
            return Err(Error::SteamCmdNotFound);
        }

        // First run lets SteamCMD update itself. Its exit code is unreliable
        // on a fresh install, so only the spawn failure is fatal.
        info!("running SteamCMD self-update");
        let mut cmd = Command::new(&exe);
        cmd.arg("+quit").current_dir(&install_dir);
        if !foreground {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        match cmd.status().await {
            Ok(status) => debug!("SteamCMD self-update exited with {}", status),
            Err(e) => return Err(Error::ProcessFailed(format!("SteamCMD self-update: {}", e))),
        }

        Ok(exe)
    }

    /// Runs `app_update 2430930 validate` against the target directory,
    /// holding the update lock for the duration. Stdout lines are mapped to
    /// 0..100 progress heuristically. Safe to re-run: `app_update` is
    /// idempotent.
    pub async fn install_or_update_asa(
        &self,
        target_dir: &Path,
        foreground: bool,
        progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let exe = self.locate().ok_or(Error::SteamCmdNotFound)?;
        let _guard = self.lock.acquire("installing ASA binaries").await;

        tokio::fs::create_dir_all(target_dir).await?;

        let target = target_dir.to_string_lossy();
        let mut cmd = Command::new(&exe);
        cmd.args([
            "+force_install_dir",
            target.as_ref(),
            "+login",
            "anonymous",
            "+app_update",
            ASA_APP_ID,
            "validate",
            "+quit",
        ]);
        cmd.kill_on_drop(true);

        // Foreground vs background only routes stdio; correctness is
        // identical either way.
        if foreground {
            let status = tokio::time::timeout(STEAMCMD_TOTAL_TIMEOUT, cmd.status())
                .await
                .map_err(|_| Error::AppUpdateFailed {
                    exit_code: None,
                    last_lines: vec!["timed out".to_owned()],
                })??;
            return if status.success() {
                Ok(())
            } else {
                Err(Error::AppUpdateFailed {
                    exit_code: status.code(),
                    last_lines: vec![],
                })
            };
        }

        cmd.stdout(Stdio::piped()).stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ProcessFailed(format!("failed to spawn SteamCMD: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProcessFailed("no stdout pipe from SteamCMD".to_owned()))?;
        let mut lines = BufReader::new(stdout).lines();

        let started = Instant::now();
        let mut last_lines: VecDeque<String> = VecDeque::with_capacity(10);

        loop {
            if started.elapsed() > STEAMCMD_TOTAL_TIMEOUT {
                let _ = child.kill().await;
                return Err(Error::AppUpdateFailed {
                    exit_code: None,
                    last_lines: last_lines.into_iter().collect(),
                });
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    // Give the sub-process a chance to finish cleanly before
                    // resorting to a kill.
                    warn!("cancel requested, waiting up to {:?} for SteamCMD", STEAMCMD_CANCEL_TIMEOUT);
                    if tokio::time::timeout(STEAMCMD_CANCEL_TIMEOUT, child.wait()).await.is_err() {
                        let _ = child.kill().await;
                    }
                    return Err(Error::Cancelled);
                }
                line = tokio::time::timeout(STEAMCMD_PROGRESS_WATCHDOG, lines.next_line()) => line,
            };

            match next {
                Err(_) => {
                    warn!("SteamCMD produced no output for {:?}, aborting", STEAMCMD_PROGRESS_WATCHDOG);
                    let _ = child.kill().await;
                    return Err(Error::AppUpdateFailed {
                        exit_code: None,
                        last_lines: last_lines.into_iter().collect(),
                    });
                }
                Ok(Ok(Some(line))) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    debug!("steamcmd: {}", trimmed);
                    if last_lines.len() == 10 {
                        last_lines.pop_front();
                    }
                    last_lines.push_back(trimmed.to_owned());

                    if let Some((stage, pct)) = parse_progress_line(trimmed) {
                        progress(pct, format!("{} {}%", stage, pct));
                    } else if trimmed.contains("Logging in") {
                        progress(1, "logging into Steam".to_owned());
                    } else if trimmed.contains("Success!") {
                        progress(100, "app_update complete".to_owned());
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    warn!("error reading SteamCMD output: {:?}", e);
                    break;
                }
            }
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::AppUpdateFailed {
                exit_code: status.code(),
                last_lines: last_lines.into_iter().collect(),
            })
        }
    }
}

/// Maps a `Update state (...) <stage>, progress: <pct>` line onto a 0..100
/// progress value.
pub fn parse_progress_line(line: &str) -> Option<(String, u8)> {
    let captures = UPDATE_STATE_RE.captures(line)?;
    let stage = captures.get(1)?.as_str().trim().to_owned();
    let pct: f64 = captures.get(2)?.as_str().parse().ok()?;
    Some((stage, pct.clamp(0.0, 100.0) as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downloading_progress_is_parsed() {
        let line = "Update state (0x61) downloading, progress: 50.00 (12345678 / 24691356)";
        let (stage, pct) = parse_progress_line(line).unwrap();
        assert_eq!(stage, "downloading");
        assert_eq!(pct, 50);
    }

    #[test]
    fn verifying_progress_is_parsed() {
        let line = "Update state (0x81) verifying update, progress: 92.51 (123 / 133)";
        let (stage, pct) = parse_progress_line(line).unwrap();
        assert_eq!(stage, "verifying update");
        assert_eq!(pct, 92);
    }

    #[test]
    fn unrelated_lines_produce_no_progress() {
        assert!(parse_progress_line("Redirecting stderr to 'logs/stderr.txt'").is_none());
        assert!(parse_progress_line("Loading Steam API...OK").is_none());
    }

    #[test]
    fn out_of_range_percentages_are_clamped() {
        let line = "Update state (0x61) downloading, progress: 123.45 (1 / 1)";
        let (_, pct) = parse_progress_line(line).unwrap();
        assert_eq!(pct, 100);
    }
}
