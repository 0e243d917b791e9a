/*!
 * rsync-backed transfer
 *
 * Spawns `rsync -a --inplace --partial --timeout <t> [--flag..] [--exclude=..]
 * <src> <dst>` and forwards every output line to the log with a `> ` prefix.
 */

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Transfer, TransferKind, TransferOutcome, TransferRequest};
use crate::error::{MirrorError, Result};
use crate::location::Location;

#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    program: String,
    /// Locations on this host are passed as plain paths
    local_host: Option<String>,
    /// Ignore every host part
    local_mode: bool,
    dry_run: bool,
}

impl Default for RsyncTransfer {
    fn default() -> Self {
        Self {
            program: "rsync".to_string(),
            local_host: None,
            local_mode: false,
            dry_run: false,
        }
    }
}

impl RsyncTransfer {
    pub fn new(local_host: impl Into<String>) -> Self {
        Self {
            local_host: Some(local_host.into()),
            ..Self::default()
        }
    }

    pub fn local_mode(mut self, enabled: bool) -> Self {
        self.local_mode = enabled;
        self
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn is_local(&self, location: &Location) -> bool {
        self.local_mode || self.local_host.as_deref() == Some(location.host.as_str())
    }

    /// `host:path` for remote locations (spaces escaped), the bare path for
    /// local ones
    fn render(&self, location: &Location, as_directory: bool) -> String {
        let mut rendered = if self.is_local(location) {
            location.path.display().to_string()
        } else {
            location.to_string().replace(' ', "\\ ")
        };
        if as_directory && !rendered.ends_with('/') {
            rendered.push('/');
        }
        rendered
    }

    pub fn arguments(&self, request: &TransferRequest) -> Vec<String> {
        let mut args = vec![
            "-a".to_string(),
            "--inplace".to_string(),
            "--partial".to_string(),
            "--timeout".to_string(),
            request.timeout.as_secs().max(1).to_string(),
        ];
        args.extend(request.flags.iter().map(|flag| format!("--{}", flag)));
        args.extend(
            request
                .excludes
                .iter()
                .map(|pattern| format!("--exclude={}", pattern)),
        );
        let source_is_dir = request.kind == TransferKind::Tree;
        args.push(self.render(&request.source, source_is_dir));
        args.push(self.render(&request.destination, true));
        args
    }
}

#[async_trait]
impl Transfer for RsyncTransfer {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferOutcome> {
        let args = self.arguments(request);
        if self.dry_run {
            info!("Dry run: {} {}", self.program, args.join(" "));
            return Ok(TransferOutcome::completed());
        }
        debug!("Running: {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MirrorError::Transfer(format!("cannot run {}: {}", self.program, e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (out_lines, err_lines) = tokio::join!(
            pump(stdout, request.quiet),
            pump(stderr, request.quiet)
        );

        let status = child
            .wait()
            .await
            .map_err(|e| MirrorError::Transfer(format!("{} did not finish: {}", self.program, e)))?;

        let outcome = TransferOutcome {
            status: status.code(),
            lines: out_lines + err_lines,
        };
        if !outcome.success() {
            warn!(
                "{} {} -> {} exited with {:?}",
                self.program, request.source, request.destination, outcome.status
            );
        }
        Ok(outcome)
    }
}

/// Log each line of `stream`; returns the line count
async fn pump<R: AsyncRead + Unpin>(stream: Option<R>, quiet: bool) -> usize {
    let Some(stream) = stream else {
        return 0;
    };
    let mut lines = BufReader::new(stream).lines();
    let mut count = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                count += 1;
                if quiet {
                    debug!("> {}", line.trim_end());
                } else {
                    info!("> {}", line.trim_end());
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading transfer output: {}", e);
                break;
            }
        }
    }
    count
}
