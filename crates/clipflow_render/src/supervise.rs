//! External encode supervision: process lifetime, progress stream, failure
//! capture.

use crate::command::Invocation;
use crate::error::RenderError;
use crate::jobs::{JobRegistry, JobState, CANCELLED_KIND};
use clipflow_core::types::TimeMs;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

/// How much of the diagnostic stream is kept for the error detail.
const STDERR_TAIL_LINES: usize = 40;

/// Spawn the invocation and drive the job to a terminal state.
///
/// The supervisor owns the process for its entire lifetime. Nothing is
/// returned; the outcome is observed through the registry.
pub async fn run(
    invocation: &Invocation,
    job_id: Uuid,
    registry: &JobRegistry,
    duration: TimeMs,
    output_path: PathBuf,
    encode_timeout: Option<Duration>,
) {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            registry
                .fail_with(job_id, &RenderError::Spawn(e.to_string()))
                .await;
            return;
        }
    };

    let stdout = child.stdout.take().unwrap();
    let stderr = child.stderr.take().unwrap();

    let stderr_task = tokio::spawn(async move {
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect::<Vec<_>>().join("\n")
    });

    let mut cancel_rx = match registry.cancel_rx(job_id).await {
        Some(rx) => rx,
        None => {
            // Job record already gone; nothing to report to.
            let _ = child.kill().await;
            stderr_task.abort();
            return;
        }
    };

    // A cancel that arrived before this subscription is latched in the
    // channel value and would never trip `changed()`.
    if *cancel_rx.borrow_and_update() {
        warn!(%job_id, "cancelled before supervision started; terminating encoder");
        let _ = child.kill().await;
        stderr_task.abort();
        registry.fail(job_id, CANCELLED_KIND, "cancelled by request").await;
        return;
    }

    let deadline = tokio::time::Instant::now()
        + encode_timeout.unwrap_or(Duration::from_secs(60 * 60 * 24 * 365));
    let timeout = tokio::time::sleep_until(deadline);
    tokio::pin!(timeout);

    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Some(pct) = progress_percent(&line, duration) {
                            registry.set_progress(job_id, pct).await;
                        }
                    }
                    _ => break,
                }
            }
            changed = cancel_rx.changed() => {
                match changed {
                    Ok(()) if *cancel_rx.borrow() => {
                        warn!(%job_id, "cancellation requested; terminating encoder");
                        let _ = child.kill().await;
                        stderr_task.abort();
                        registry.fail(job_id, CANCELLED_KIND, "cancelled by request").await;
                        return;
                    }
                    Ok(()) => {}
                    Err(_) => {
                        // Record removed out from under us; stop the process.
                        let _ = child.kill().await;
                        stderr_task.abort();
                        return;
                    }
                }
            }
            _ = &mut timeout, if encode_timeout.is_some() => {
                warn!(%job_id, "encode deadline exceeded; terminating encoder");
                let _ = child.kill().await;
                stderr_task.abort();
                registry.fail(
                    job_id,
                    "EncodeError",
                    &format!("encode timed out after {}s", encode_timeout.unwrap_or_default().as_secs()),
                ).await;
                return;
            }
        }
    }

    let status = child.wait().await;
    let tail = stderr_task.await.unwrap_or_default();

    match status {
        Ok(status) if status.success() => {
            if registry
                .transition(job_id, JobState::Running, JobState::Completed)
                .await
            {
                registry
                    .update(job_id, |job| {
                        job.progress = 100;
                        job.output_path = Some(output_path.clone());
                    })
                    .await;
                info!(%job_id, output = %output_path.display(), "encode complete");
            }
        }
        Ok(status) => {
            let detail = if tail.is_empty() {
                format!("encoder exited with {status}")
            } else {
                format!("encoder exited with {status}: {tail}")
            };
            registry.fail(job_id, "EncodeError", &detail).await;
        }
        Err(e) => {
            registry
                .fail(job_id, "EncodeError", &format!("wait failed: {e}"))
                .await;
        }
    }
}

/// Parse one progress line into a percentage of the plan duration.
///
/// The toolchain streams `key=value` lines; `out_time_ms` carries the
/// elapsed output time in microseconds despite its name, and can go
/// negative before the first frame is emitted. Values are clamped to
/// `[0, 100]`; regressions are handled by the registry, which never lets
/// stored progress decrease.
pub fn progress_percent(line: &str, total: TimeMs) -> Option<u32> {
    let raw = line.strip_prefix("out_time_ms=")?.trim();
    let us: i64 = raw.parse().ok()?;
    if total.0 == 0 {
        return Some(0);
    }
    let elapsed_ms = us.max(0) as f64 / 1_000.0;
    let pct = elapsed_ms / total.0 as f64 * 100.0;
    Some(pct.clamp(0.0, 100.0) as u32)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
