use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use log::{debug, info, warn};
use tokio::process::{Child, ChildStdin, Command};

use crate::error::SessionError;
use crate::output::OutputDir;

/// Builds the transcoder command line for one output directory.
pub trait Launcher: Send + Sync + 'static {
    fn command(&self, output: &OutputDir) -> Command;
}

/// Fixed ffmpeg profile: FLV on stdin, rolling HLS window on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscoderProfile {
    pub program: PathBuf,
    pub video_codec: String,
    pub audio_codec: String,
    pub segment_seconds: u32,
    pub list_size: u32,
    pub low_latency: bool,
}

impl Default for TranscoderProfile {
    fn default() -> Self {
        TranscoderProfile {
            program: PathBuf::from("ffmpeg"),
            video_codec: "copy".to_string(),
            audio_codec: "aac".to_string(),
            segment_seconds: 2,
            list_size: 5,
            low_latency: true,
        }
    }
}

impl TranscoderProfile {
    pub fn args(&self, output: &OutputDir) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(24);
        if self.low_latency {
            args.extend(["-fflags", "nobuffer", "-flags", "low_delay"].map(OsString::from));
        }
        args.extend(["-i", "pipe:0", "-c:v"].map(OsString::from));
        args.push(self.video_codec.clone().into());
        args.push("-c:a".into());
        args.push(self.audio_codec.clone().into());
        args.extend(["-f", "hls", "-hls_time"].map(OsString::from));
        args.push(self.segment_seconds.to_string().into());
        args.push("-hls_list_size".into());
        args.push(self.list_size.to_string().into());
        args.push("-hls_flags".into());
        args.push("split_by_time+delete_segments+program_date_time".into());
        args.push(output.playlist().into_os_string());
        args
    }
}

impl Launcher for TranscoderProfile {
    fn command(&self, output: &OutputDir) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.args(output)).current_dir(&output.path);
        command
    }
}

/// A running transcoder. Consumed by [`Transcoder::terminate`], so it can
/// only be killed once.
pub struct Transcoder {
    child: Child,
    pid: Option<u32>,
}

impl Transcoder {
    /// Spawns `command` with a piped stdin and inherited stdout/stderr.
    pub fn spawn(mut command: Command) -> Result<(Transcoder, ChildStdin), SessionError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // SAFETY: prctl is async-signal-safe and touches no memory of the parent.
        unsafe {
            command.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| SessionError::Startup(format!("failed to spawn transcoder: {}", e)))?;
        let pid = child.id();

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                // kill_on_drop reclaims the child
                return Err(SessionError::Startup(
                    "transcoder stdin was not captured".to_string(),
                ));
            }
        };

        info!("Spawned transcoder (pid {:?})", pid);
        Ok((Transcoder { child, pid }, stdin))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Sends SIGKILL without waiting for exit. The runtime reaps the child
    /// in the background once the handle is dropped.
    pub fn terminate(mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Transcoder (pid {:?}) already exited: {}", self.pid, status);
            }
            _ => {
                if let Err(e) = self.child.start_kill() {
                    warn!("Failed to kill transcoder (pid {:?}): {}", self.pid, e);
                } else {
                    info!("Killed transcoder (pid {:?})", self.pid);
                }
            }
        }
    }
}
