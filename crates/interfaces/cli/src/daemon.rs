//! Background daemon lifecycle: pid/lock files, spawn, stop, status.

use std::fs;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Result, bail};
use fs2::FileExt;

use foreman_config::ForemanConfig;

#[derive(Debug, Clone)]
struct DaemonPaths {
    runtime_dir: PathBuf,
    pid_file: PathBuf,
    log_file: PathBuf,
    lock_file: PathBuf,
}

fn daemon_paths() -> DaemonPaths {
    let runtime_dir = Path::new(".foreman").join("runtime");
    DaemonPaths {
        pid_file: runtime_dir.join("daemon.pid"),
        log_file: runtime_dir.join("daemon.log"),
        lock_file: runtime_dir.join("daemon.lock"),
        runtime_dir,
    }
}

pub(crate) fn start(config_path: &str, force: bool) -> Result<()> {
    let paths = daemon_paths();
    fs::create_dir_all(&paths.runtime_dir)?;

    if let Some(pid) = read_pid(&paths.pid_file)? {
        if is_pid_running(pid) {
            if !force {
                bail!("daemon already running with pid {pid}; use `foreman daemon restart`");
            }
            terminate_pid(pid)?;
            wait_for_pid_exit(pid, Duration::from_secs(4));
        }
        let _ = fs::remove_file(&paths.pid_file);
    }

    // a crashed daemon can leave a stale lock; safe to clear once we know
    // no live process holds the pid
    if force && paths.lock_file.exists() {
        let _ = fs::remove_file(&paths.lock_file);
    }

    let exe = std::env::current_exe()?;
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;
    let err = out.try_clone()?;

    let mut child = Command::new(exe)
        .env("FOREMAN_DAEMON_PROCESS", "1")
        .env("FOREMAN_CONFIG", config_path)
        .arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .spawn()?;

    fs::write(&paths.pid_file, child.id().to_string())?;

    // give the child a moment to fail fast on bad config
    for _ in 0..20 {
        if let Some(status) = child.try_wait()? {
            let _ = fs::remove_file(&paths.pid_file);
            bail!(
                "daemon exited during startup with status {status}; check {}",
                paths.log_file.display()
            );
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    println!("daemon started");
    println!("- pid: {}", child.id());
    println!("- log: {}", paths.log_file.display());
    Ok(())
}

pub(crate) fn stop() -> Result<()> {
    let paths = daemon_paths();
    let Some(pid) = read_pid(&paths.pid_file)? else {
        println!("daemon is not running");
        return Ok(());
    };

    if !is_pid_running(pid) {
        let _ = fs::remove_file(&paths.pid_file);
        println!("daemon was not running (stale pid file cleaned)");
        return Ok(());
    }

    terminate_pid(pid)?;
    wait_for_pid_exit(pid, Duration::from_secs(6));
    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    println!("daemon stopped (pid {pid})");
    Ok(())
}

pub(crate) fn status() -> Result<()> {
    let paths = daemon_paths();
    match read_pid(&paths.pid_file)? {
        Some(pid) if is_pid_running(pid) => {
            println!("daemon status: running");
            println!("- pid: {pid}");
            println!("- log: {}", paths.log_file.display());
        }
        Some(pid) => {
            println!("daemon status: stopped (stale pid {pid})");
        }
        None => {
            println!("daemon status: stopped");
        }
    }
    Ok(())
}

/// The spawned child: take the exclusive lock, write our pid, and run
/// the supervisor until terminated.
pub(crate) async fn run_daemon_process(config: ForemanConfig) -> Result<()> {
    let paths = daemon_paths();
    fs::create_dir_all(&paths.runtime_dir)?;
    let lock_file = File::create(&paths.lock_file)?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| anyhow::anyhow!("another foreman instance already holds the lock"))?;

    fs::write(&paths.pid_file, std::process::id().to_string())?;

    let result = crate::run_foreground(config).await;

    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    result
}

fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(raw.trim().parse::<u32>().ok())
}

fn is_pid_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn terminate_pid(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let status = Command::new("kill").arg(pid.to_string()).status()?;
        if !status.success() {
            bail!("failed to terminate daemon pid {pid}");
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        bail!("daemon stop is only implemented on unix in this build")
    }
}

fn wait_for_pid_exit(pid: u32, timeout: Duration) {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < timeout {
        if !is_pid_running(pid) {
            return;
        }
        std::thread::sleep(step);
        waited += step;
    }
}
