use crate::config::{SandboxConfig, SupervisorConfig};
use crate::error::{Result, SupervisorError};
use crate::ipc::{socket_pair, CHILD_IPC_FD, IPC_FD_ENV};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{dup2, Pid};
use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Everything needed to launch one analysis
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub analysis_id: String,
    pub runtime: PathBuf,
    pub script: PathBuf,
    pub working_dir: PathBuf,
    /// Runtime flags placed before the script path
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(
        config: &SupervisorConfig,
        analysis_id: &str,
        env: HashMap<String, String>,
    ) -> Self {
        let script = config.script_path(analysis_id);
        let working_dir = config.analysis_dir(analysis_id);
        let args = sandbox_flags(&config.sandbox, &working_dir, &config.runtime);

        Self {
            analysis_id: analysis_id.to_string(),
            runtime: config.runtime.clone(),
            script,
            working_dir,
            args,
            env,
        }
    }
}

/// Runtime permission flags for a sandboxed analysis
///
/// Reads are limited to the analysis' own directory, the runtime installation
/// and any configured extra paths. Write access is never granted.
pub fn sandbox_flags(sandbox: &SandboxConfig, analysis_dir: &Path, runtime: &Path) -> Vec<String> {
    if !sandbox.enabled {
        return Vec::new();
    }

    let mut flags = vec!["--permission".to_string()];
    flags.push(format!("--allow-fs-read={}", analysis_dir.display()));

    if let Some(runtime_dir) = runtime.parent().filter(|p| !p.as_os_str().is_empty()) {
        flags.push(format!("--allow-fs-read={}", runtime_dir.display()));
    }

    for path in &sandbox.read_paths {
        flags.push(format!("--allow-fs-read={}", path.display()));
    }

    if sandbox.allow_child_process {
        flags.push("--allow-child-process".to_string());
    }
    if sandbox.allow_worker_threads {
        flags.push("--allow-worker".to_string());
    }

    flags
}

/// A freshly launched analysis
#[derive(Debug)]
pub struct SpawnedAnalysis {
    pub child: Child,
    pub pid: u32,
    /// Supervisor end of the IPC socket
    pub ipc: StdUnixStream,
}

/// Launch an analysis with piped output and an IPC socket on fd 3
pub fn spawn_analysis(launch: &LaunchSpec) -> Result<SpawnedAnalysis> {
    if !launch.script.exists() {
        return Err(SupervisorError::ScriptNotFound(
            launch.script.display().to_string(),
        ));
    }

    let (parent_end, child_end) = socket_pair()?;
    let child_fd = child_end.as_raw_fd();

    let mut command = Command::new(&launch.runtime);
    command
        .args(&launch.args)
        .arg(&launch.script)
        .current_dir(&launch.working_dir)
        .envs(&launch.env)
        .env(IPC_FD_ENV, CHILD_IPC_FD.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Only async-signal-safe calls between fork and exec
    unsafe {
        command.pre_exec(move || {
            if child_fd == CHILD_IPC_FD {
                fcntl(child_fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
            } else {
                // dup2 leaves the new descriptor without FD_CLOEXEC
                dup2(child_fd, CHILD_IPC_FD)?;
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        SupervisorError::LaunchError(
            launch.analysis_id.clone(),
            format!("{}: {}", launch.runtime.display(), e),
        )
    })?;

    // The child holds its own copy now
    drop(child_end);

    let pid = child.id().ok_or_else(|| {
        SupervisorError::LaunchError(
            launch.analysis_id.clone(),
            "process exited before its pid could be read".to_string(),
        )
    })?;

    Ok(SpawnedAnalysis {
        child,
        pid,
        ipc: parent_end,
    })
}

/// Send a signal to a process. A process that is already gone is not an error.
pub fn signal_process(pid: u32, signal: Signal) -> Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| SupervisorError::SignalError(format!("Invalid pid {}", pid)))?;

    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::SignalError(format!(
            "Failed to send {} to pid {}: {}",
            signal, pid, e
        ))),
    }
}
