use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use retro_types::{Result, RetroError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::runner::{CommandSpec, ExecResult, ProcessRunner};

/// How long to keep draining pipes after the child has been killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Runs commands as local child processes.
///
/// Each child is the leader of its own process group so a timeout can take
/// down everything it forked (KNIME spawns a JVM, rp2paths spawns workers).
#[derive(Debug, Clone, Default)]
pub struct LocalProcessRunner;

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for LocalProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecResult> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
            if let Some(bytes) = spec.memory_limit_bytes {
                let limit = memory_cap(bytes)?;
                // SAFETY: the hook only calls the async-signal-safe setrlimit.
                unsafe {
                    cmd.pre_exec(move || {
                        if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
            }
        }

        tracing::debug!(command = %spec, timeout = ?spec.timeout, memory = ?spec.memory_limit_bytes, "spawning");

        let start = tokio::time::Instant::now();
        let mut child = cmd.spawn().map_err(|source| RetroError::Spawn {
            program: spec.program_name(),
            source,
        })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let pid = child.id();

        let (status, timed_out) = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => (Some(status?), false),
                Err(_) => {
                    tracing::warn!(program = %spec.program_name(), ?limit, "timeout reached, killing process group");
                    kill_group(pid);
                    let _ = child.kill().await;
                    (None, true)
                }
            },
            None => (Some(child.wait().await?), false),
        };

        let stdout = collect(stdout, timed_out).await;
        let stderr = collect(stderr, timed_out).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(
            program = %spec.program_name(),
            exit_code = ?status.and_then(|s| s.code()),
            timed_out,
            duration_ms,
            "child finished"
        );

        Ok(ExecResult {
            stdout,
            stderr,
            exit_code: status.and_then(|s| s.code()),
            timed_out,
            duration_ms,
        })
    }
}

/// Build the rlimit for the child, refusing requests above the hard ceiling.
#[cfg(unix)]
fn memory_cap(bytes: u64) -> Result<libc::rlimit> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the struct we own.
    if unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut current) } != 0 {
        return Err(RetroError::MemoryLimit {
            requested: bytes,
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    let requested = bytes as libc::rlim_t;
    if current.rlim_max != libc::RLIM_INFINITY && requested > current.rlim_max {
        return Err(RetroError::MemoryLimit {
            requested: bytes,
            reason: format!("hard limit is {} bytes", current.rlim_max),
        });
    }
    Ok(libc::rlimit {
        rlim_cur: requested,
        rlim_max: current.rlim_max,
    })
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: signalling a process group we created.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

fn drain<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>, killed: bool) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    let bytes = if killed {
        match tokio::time::timeout(DRAIN_GRACE, handle).await {
            Ok(Ok(buf)) => buf,
            _ => Vec::new(),
        }
    } else {
        handle.await.unwrap_or_default()
    };
    String::from_utf8_lossy(&bytes).into_owned()
}
