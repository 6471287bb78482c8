//! Transcoder Supervisor (C4) — spawns, monitors, and terminates external
//! encoder processes that turn an ingest into segmented HLS output (spec
//! §3, §4.3). Grounded on `transcoder.rs`'s `Transcoder`: a `watch`-channel
//! stop signal, a `tokio::select!`-driven background task per process, and
//! a `sysinfo`-backed CPU monitor, simplified since this supervisor writes
//! HLS directly to disk instead of also parsing an fMP4 stdout pipe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::metrics::{ACTIVE_TRANSCODERS, TRANSCODER_CPU_USAGE};

const STOP_GRACE: Duration = Duration::from_secs(3);

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct TranscoderEntry {
    pid: u32,
    started_at: u64,
    stop_tx: watch::Sender<bool>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TranscoderStats {
    pub active: usize,
    pub max_concurrent: usize,
}

pub struct TranscoderSupervisor {
    entries: Arc<RwLock<HashMap<String, TranscoderEntry>>>,
    storage_root: PathBuf,
    ffmpeg_path: String,
    segment_duration: u32,
    playlist_size: u32,
    max_concurrent: usize,
}

impl TranscoderSupervisor {
    pub fn new(
        storage_root: PathBuf,
        ffmpeg_path: String,
        segment_duration: u32,
        playlist_size: u32,
        max_concurrent: usize,
    ) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            storage_root,
            ffmpeg_path,
            segment_duration,
            playlist_size,
            max_concurrent,
        }
    }

    pub fn stream_dir(&self, stream_id: &str) -> PathBuf {
        self.storage_root.join(stream_id)
    }

    /// Refuses with `Ok(false)` if a process already exists for `streamId`
    /// or the concurrency cap is reached (spec §4.3). Returns `Ok(false)`
    /// (rather than an error) if the spawn itself fails, per the error
    /// taxonomy in spec §7 ("start() returns false; no entry recorded").
    pub async fn start(&self, stream_id: &str, input_url: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(stream_id) {
            return Ok(false);
        }
        if entries.len() >= self.max_concurrent {
            return Ok(false);
        }

        let dir = self.stream_dir(stream_id);
        if let Err(e) = create_stream_dir(&dir).await {
            warn!(%stream_id, error = %e, "failed to create hls output directory");
            return Ok(false);
        }

        let args = self.ffmpeg_args(&dir, input_url);
        let child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                error!(%stream_id, error = %e, "failed to spawn encoder");
                return Ok(false);
            }
        };

        let Some(pid) = child.id() else {
            return Ok(false);
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        entries.insert(
            stream_id.to_string(),
            TranscoderEntry {
                pid,
                started_at: now_epoch_secs(),
                stop_tx,
            },
        );
        ACTIVE_TRANSCODERS.set(entries.len() as f64);
        drop(entries);

        info!(%stream_id, pid, input_url, "encoder started");
        spawn_supervised_process(stream_id.to_string(), child.stderr.take(), child, stop_rx, pid);
        Ok(true)
    }

    /// Sends a graceful signal immediately, schedules a forced kill after
    /// the grace period, and unconditionally removes the map entry —
    /// further liveness checks after `stop` are the caller's business, not
    /// the supervisor's (spec §4.3).
    pub async fn stop(&self, stream_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.remove(stream_id) else {
            return false;
        };
        ACTIVE_TRANSCODERS.set(entries.len() as f64);
        let _ = entry.stop_tx.send(true);
        info!(%stream_id, pid = entry.pid, "encoder stop requested");
        true
    }

    /// Existence of an entry AND a pid-0-signal liveness probe. A failed
    /// probe evicts the entry as a side effect (spec §4.3).
    pub async fn is_active(&self, stream_id: &str) -> bool {
        let pid = {
            let entries = self.entries.read().await;
            match entries.get(stream_id) {
                Some(entry) => entry.pid,
                None => return false,
            }
        };
        if probe_alive(pid) {
            true
        } else {
            let mut entries = self.entries.write().await;
            entries.remove(stream_id);
            ACTIVE_TRANSCODERS.set(entries.len() as f64);
            false
        }
    }

    /// Removes all files in the stream directory, then the directory
    /// itself. Idempotent: a missing directory is not an error.
    pub async fn cleanup(&self, stream_id: &str) -> Result<()> {
        let dir = self.stream_dir(stream_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OrchestratorError::Io(e)),
        }
    }

    pub async fn stop_all(&self) {
        let stream_ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for stream_id in stream_ids {
            self.stop(&stream_id).await;
        }
    }

    pub async fn stats(&self) -> TranscoderStats {
        TranscoderStats {
            active: self.entries.read().await.len(),
            max_concurrent: self.max_concurrent,
        }
    }

    /// ffmpeg arguments implementing spec §4.3's HLS encoding contract:
    /// segment duration D, playlist size W, sliding-window segment
    /// deletion, append-list playlists, H.264 CRF 23 veryfast/zerolatency,
    /// AAC 128kbps/44.1kHz.
    fn ffmpeg_args(&self, dir: &Path, input_url: &str) -> Vec<String> {
        let playlist = dir.join("playlist.m3u8").to_string_lossy().to_string();
        let segment_pattern = dir.join("segment_%05d.ts").to_string_lossy().to_string();

        vec![
            "-y".into(),
            "-i".into(),
            input_url.to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0?".into(),
            "-sn".into(),
            "-dn".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-crf".into(),
            "23".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "128k".into(),
            "-ar".into(),
            "44100".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            self.segment_duration.to_string(),
            "-hls_list_size".into(),
            self.playlist_size.to_string(),
            "-hls_flags".into(),
            "delete_segments+append_list".into(),
            "-hls_segment_filename".into(),
            segment_pattern,
            playlist,
        ]
    }
}

async fn create_stream_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        tokio::fs::set_permissions(dir, perms).await?;
    }
    Ok(())
}

/// Drives the spawned process to completion: waits for either a stop
/// request or process exit, reaping the child either way so it never
/// becomes a zombie. On a stop request, sends a graceful signal and
/// escalates to a forced kill after `STOP_GRACE` if the process is still
/// running, matching the hard invariant in spec §4.3.
fn spawn_supervised_process(
    stream_id: String,
    stderr: Option<tokio::process::ChildStderr>,
    mut child: Child,
    mut stop_rx: watch::Receiver<bool>,
    pid: u32,
) {
    if let Some(stderr) = stderr {
        let stream_id_log = stream_id.clone();
        tokio::spawn(async move {
            use tokio::io::{AsyncBufReadExt, BufReader};
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(stream_id = %stream_id_log, "ffmpeg: {}", line);
            }
        });
    }

    let cpu_stream_id = stream_id.clone();
    let mut cpu_stop_rx = stop_rx.clone();
    tokio::spawn(async move {
        let mut sys = sysinfo::System::new();
        let sys_pid = sysinfo::Pid::from_u32(pid);
        loop {
            tokio::select! {
                _ = cpu_stop_rx.changed() => break,
                _ = tokio::time::sleep(Duration::from_secs(5)) => {
                    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[sys_pid]), true);
                    match sys.process(sys_pid) {
                        Some(process) => {
                            TRANSCODER_CPU_USAGE
                                .with_label_values(&[&cpu_stream_id])
                                .set(process.cpu_usage() as f64);
                        }
                        None => break,
                    }
                }
            }
        }
        TRANSCODER_CPU_USAGE.with_label_values(&[&cpu_stream_id]).set(0.0);
    });

    tokio::spawn(async move {
        tokio::select! {
            _ = stop_rx.changed() => {
                signal_terminate(pid);
                tokio::select! {
                    status = child.wait() => {
                        info!(%stream_id, pid, ?status, "encoder exited after graceful stop");
                    }
                    _ = tokio::time::sleep(STOP_GRACE) => {
                        warn!(%stream_id, pid, "encoder did not exit within grace period, forcing kill");
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                    }
                }
            }
            status = child.wait() => {
                warn!(%stream_id, pid, ?status, "encoder exited unexpectedly");
            }
        }
    });
}

#[cfg(unix)]
fn signal_terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) {}

#[cfg(unix)]
fn probe_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn probe_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(max_concurrent: usize) -> TranscoderSupervisor {
        let dir = std::env::temp_dir().join(format!("fabriq-test-{}", now_epoch_secs()));
        TranscoderSupervisor::new(dir, "/bin/false".to_string(), 4, 5, max_concurrent)
    }

    #[tokio::test]
    async fn duplicate_start_is_refused() {
        let sup = supervisor(4);
        // /bin/false exits immediately but still spawns, which is enough to
        // populate an entry before the watcher task reaps it.
        let first = sup.start("stream_a", "pipe:0").await.unwrap();
        assert!(first);
        let second = sup.start("stream_a", "pipe:0").await.unwrap();
        assert!(!second);
        sup.cleanup("stream_a").await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_cap_is_enforced() {
        let sup = supervisor(1);
        assert!(sup.start("stream_a", "pipe:0").await.unwrap());
        assert!(!sup.start("stream_b", "pipe:0").await.unwrap());
        let stats = sup.stats().await;
        assert_eq!(stats.active, 1);
        sup.cleanup("stream_a").await.unwrap();
        sup.cleanup("stream_b").await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sup = supervisor(4);
        assert!(sup.start("stream_a", "pipe:0").await.unwrap());
        assert!(sup.stop("stream_a").await);
        assert!(!sup.stop("stream_a").await);
        sup.cleanup("stream_a").await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_on_missing_dir() {
        let sup = supervisor(4);
        sup.cleanup("stream_never_started").await.unwrap();
        sup.cleanup("stream_never_started").await.unwrap();
    }
}
