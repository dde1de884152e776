//! Device monitor: serve whichever candidate device exposes the flag file.
//!
//! Every period the monitor checks each candidate for `<root>/<flag>`. On the
//! first match it launches a session for that device and blocks until the
//! session ends, then resumes scanning. At most one session is ever active.
//!
//! Sessions are started by a [`SessionLauncher`]: [`ProcessLauncher`] runs the
//! `udpbd-server` binary as a child process, [`TaskLauncher`] runs the session
//! in-process. Both are spawn-and-join.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{CandidateConfig, Config, DeviceKind, MonitorConfig};
use crate::error::MonitorError;
use crate::session::Session;
use crate::transport::SessionEnd;

/// A device the monitor may serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub device: PathBuf,
    /// Directory the flag file is looked for in, usually the device's mount point.
    pub root: PathBuf,
}

impl Candidate {
    pub fn new(device: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            root: root.into(),
        }
    }

    pub fn marker(&self, flag: &str) -> PathBuf {
        self.root.join(flag)
    }

    /// Unreadable roots (unmounted, permission denied) count as unmarked.
    pub async fn has_marker(&self, flag: &str) -> bool {
        tokio::fs::try_exists(self.marker(flag))
            .await
            .unwrap_or(false)
    }
}

impl From<&CandidateConfig> for Candidate {
    fn from(config: &CandidateConfig) -> Self {
        Self::new(&config.device, &config.root)
    }
}

/// How a launched session finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// The session ended on its own.
    Finished,
    /// The session was terminated because shutdown was requested.
    Terminated,
    /// The session process exited unsuccessfully on its own.
    Failed(ExitStatus),
}

/// Starts a session for a candidate and waits for it to end.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(
        &self,
        candidate: &Candidate,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SessionExit, MonitorError>;
}

/// Resolves once shutdown is requested (or its sender is gone).
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|&stop| stop).await;
}

/// Runs the server binary as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub program: PathBuf,
    pub read_only: bool,
    /// Passed through as `--config`.
    pub config_path: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            program: program.into(),
            read_only,
            config_path: None,
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    fn command(&self, device: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("--path").arg(device);
        if self.read_only {
            command.arg("--read-only");
        }
        if let Some(config) = &self.config_path {
            command.arg("--config").arg(config);
        }
        command.kill_on_drop(true);
        command
    }
}

#[async_trait]
impl SessionLauncher for ProcessLauncher {
    async fn launch(
        &self,
        candidate: &Candidate,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionExit, MonitorError> {
        let mut child =
            self.command(&candidate.device)
                .spawn()
                .map_err(|source| MonitorError::Spawn {
                    program: self.program.clone(),
                    source,
                })?;
        info!(
            pid = child.id(),
            device = %candidate.device.display(),
            "Started session process"
        );

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(MonitorError::Wait)?;
                if status.success() {
                    info!(%status, "Session process exited");
                    Ok(SessionExit::Finished)
                } else {
                    warn!(%status, "Session process exited with failure");
                    Ok(SessionExit::Failed(status))
                }
            }
            _ = shutdown_requested(&mut shutdown) => {
                if let Some(pid) = child.id() {
                    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        warn!(pid, error = %e, "Failed to signal session process");
                    }
                }
                let status = child.wait().await.map_err(MonitorError::Wait)?;
                info!(%status, "Session process terminated");
                Ok(SessionExit::Terminated)
            }
        }
    }
}

/// Runs the session in-process on a spawned task.
#[derive(Debug, Clone)]
pub struct TaskLauncher {
    config: Config,
}

impl TaskLauncher {
    /// `config` supplies everything but the device path, which comes from the candidate.
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionLauncher for TaskLauncher {
    async fn launch(
        &self,
        candidate: &Candidate,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SessionExit, MonitorError> {
        let mut config = self.config.clone();
        config.device.kind = DeviceKind::File;
        config.device.path = Some(candidate.device.clone());
        config.device.read_only = config.monitor.read_only;

        let handle = tokio::spawn(async move {
            let session = Session::open(&config).await?;
            session.serve(shutdown).await
        });

        match handle.await {
            Ok(Ok(SessionEnd::Shutdown)) => Ok(SessionExit::Terminated),
            Ok(Ok(SessionEnd::DeviceLost)) => Ok(SessionExit::Finished),
            Ok(Err(e)) => Err(MonitorError::Session {
                device: candidate.device.clone(),
                source: Box::new(e),
            }),
            Err(_) => Err(MonitorError::Join),
        }
    }
}

pub struct Monitor<L> {
    candidates: Vec<Candidate>,
    flag: String,
    period: Duration,
    launcher: L,
    scans: AtomicU64,
}

impl<L: SessionLauncher> Monitor<L> {
    pub fn new(config: &MonitorConfig, launcher: L) -> Self {
        Self {
            candidates: config.candidates.iter().map(Candidate::from).collect(),
            flag: config.flag.clone(),
            period: config.period(),
            launcher,
            scans: AtomicU64::new(0),
        }
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Number of scans performed so far.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    /// Check every candidate once; returns the first one exposing the flag.
    pub async fn scan(&self) -> Option<&Candidate> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        for candidate in &self.candidates {
            if candidate.has_marker(&self.flag).await {
                return Some(candidate);
            }
        }
        None
    }

    /// Scan, serve, repeat until shutdown.
    ///
    /// Shutdown is honored between cycles; an active session receives the
    /// same signal and is awaited before this returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            candidates = self.candidates.len(),
            flag = %self.flag,
            period_secs = self.period.as_secs(),
            "Device monitor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some(candidate) = self.scan().await {
                info!(
                    device = %candidate.device.display(),
                    marker = %candidate.marker(&self.flag).display(),
                    "Found flag"
                );
                match self.launcher.launch(candidate, shutdown.clone()).await {
                    Ok(SessionExit::Failed(status)) => {
                        error!(device = %candidate.device.display(), %status, "Session failed")
                    }
                    Ok(exit) => info!(device = %candidate.device.display(), ?exit, "Session ended"),
                    Err(e) => error!(error = %e, "Session failed"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.period) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        info!(scans = self.scan_count(), "Device monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use parking_lot::Mutex;

    use super::*;

    /// Records launches and holds each session open for a fixed time.
    #[derive(Default)]
    struct FakeLauncher {
        hold: Duration,
        fail: bool,
        launches: Mutex<Vec<PathBuf>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    #[async_trait]
    impl SessionLauncher for Arc<FakeLauncher> {
        async fn launch(
            &self,
            candidate: &Candidate,
            mut shutdown: watch::Receiver<bool>,
        ) -> Result<SessionExit, MonitorError> {
            self.launches.lock().push(candidate.device.clone());
            if self.fail {
                return Err(MonitorError::Join);
            }
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            let exit = tokio::select! {
                _ = tokio::time::sleep(self.hold) => SessionExit::Finished,
                _ = shutdown_requested(&mut shutdown) => SessionExit::Terminated,
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(exit)
        }
    }

    fn config(roots: &[(&str, &Path)], flag: &str) -> MonitorConfig {
        MonitorConfig {
            period_secs: 10,
            flag: flag.to_string(),
            candidates: roots
                .iter()
                .map(|(device, root)| CandidateConfig {
                    device: PathBuf::from(device),
                    root: root.to_path_buf(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scan_finds_first_marked_candidate() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let monitor = Monitor::new(
            &config(&[("/dev/sda1", a.path()), ("/dev/sdb1", b.path())], "udpbd"),
            Arc::new(FakeLauncher::default()),
        );

        assert_eq!(monitor.scan().await, None);
        std::fs::write(b.path().join("udpbd"), b"").unwrap();
        assert_eq!(
            monitor.scan().await.unwrap().device,
            PathBuf::from("/dev/sdb1")
        );
        std::fs::write(a.path().join("udpbd"), b"").unwrap();
        assert_eq!(
            monitor.scan().await.unwrap().device,
            PathBuf::from("/dev/sda1")
        );
        assert_eq!(monitor.scan_count(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scan_leaves_runtime_free_for_other_tasks() {
        let roots: Vec<_> = (0..32).map(|_| tempfile::tempdir().unwrap()).collect();
        let devices: Vec<String> = (0..roots.len()).map(|i| format!("/dev/sd{i}")).collect();
        let candidates: Vec<(&str, &Path)> = devices
            .iter()
            .zip(&roots)
            .map(|(device, root)| (device.as_str(), root.path()))
            .collect();
        let monitor = Monitor::new(
            &config(&candidates, "udpbd"),
            Arc::new(FakeLauncher::default()),
        );

        // Each marker check suspends the scan, so a task sharing the
        // single-threaded runtime gets to run before the scan completes.
        let ran = Arc::new(AtomicBool::new(false));
        let other = tokio::spawn({
            let ran = ran.clone();
            async move { ran.store(true, Ordering::SeqCst) }
        });
        assert_eq!(monitor.scan().await, None);
        assert!(ran.load(Ordering::SeqCst));
        other.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn serves_device_once_flag_appears() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher {
            hold: Duration::from_secs(3600),
            ..Default::default()
        });
        let monitor = Arc::new(Monitor::new(
            &config(&[("/dev/sda1", a.path()), ("/dev/sdb1", b.path())], "pyudpbd"),
            launcher.clone(),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run(rx).await }
        });

        // Scans at t=0, 10, 20.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(monitor.scan_count(), 3);
        assert!(launcher.launches.lock().is_empty());

        std::fs::write(b.path().join("pyudpbd"), b"").unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(monitor.scan_count(), 4);
        assert_eq!(*launcher.launches.lock(), vec![PathBuf::from("/dev/sdb1")]);

        // The session blocks further scans.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(monitor.scan_count(), 4);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(launcher.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn never_runs_two_sessions() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("udpbd"), b"").unwrap();
        std::fs::write(b.path().join("udpbd"), b"").unwrap();
        let launcher = Arc::new(FakeLauncher {
            hold: Duration::from_secs(15),
            ..Default::default()
        });
        let monitor = Arc::new(Monitor::new(
            &config(&[("/dev/sda1", a.path()), ("/dev/sdb1", b.path())], "udpbd"),
            launcher.clone(),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let launches = launcher.launches.lock().clone();
        assert!(launches.len() >= 3, "launches: {launches:?}");
        assert!(launches.iter().all(|d| d == Path::new("/dev/sda1")));
        assert_eq!(launcher.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_keeps_scanning() {
        let a = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("udpbd"), b"").unwrap();
        let launcher = Arc::new(FakeLauncher {
            fail: true,
            ..Default::default()
        });
        let monitor = Arc::new(Monitor::new(
            &config(&[("/dev/sda1", a.path())], "udpbd"),
            launcher.clone(),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(launcher.launches.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_terminates_active_session() {
        let a = tempfile::tempdir().unwrap();
        std::fs::write(a.path().join("udpbd"), b"").unwrap();
        let launcher = Arc::new(FakeLauncher {
            hold: Duration::from_secs(3600),
            ..Default::default()
        });
        let monitor = Arc::new(Monitor::new(
            &config(&[("/dev/sda1", a.path())], "udpbd"),
            launcher.clone(),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(launcher.active.load(Ordering::SeqCst), 1);
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(launcher.active.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.scan_count(), 1);
    }

    #[tokio::test]
    async fn process_launcher_reports_spawn_failure() {
        let launcher = ProcessLauncher::new("/nonexistent/udpbd-server", true);
        let (_tx, rx) = watch::channel(false);
        let result = launcher
            .launch(&Candidate::new("/dev/sda1", "/media/usb0"), rx)
            .await;
        assert!(matches!(result, Err(MonitorError::Spawn { .. })));
    }

    #[tokio::test]
    async fn process_launcher_passes_device_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args");
        let script = dir.path().join("fake-server");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" > {}\n", args_file.display()),
        )
        .unwrap();
        set_executable(&script);

        let launcher = ProcessLauncher::new(&script, true).with_config_path("/etc/udpbd.toml");
        let (_tx, rx) = watch::channel(false);
        let exit = launcher
            .launch(&Candidate::new("/dev/sdb1", dir.path()), rx)
            .await
            .unwrap();
        assert_eq!(exit, SessionExit::Finished);
        assert_eq!(
            std::fs::read_to_string(&args_file).unwrap().trim(),
            "--path /dev/sdb1 --read-only --config /etc/udpbd.toml"
        );
    }

    #[tokio::test]
    async fn process_launcher_reports_failed_exit() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-server");
        std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        set_executable(&script);

        let launcher = ProcessLauncher::new(&script, true);
        let (_tx, rx) = watch::channel(false);
        let exit = launcher
            .launch(&Candidate::new("/dev/sdb1", dir.path()), rx)
            .await
            .unwrap();
        match exit {
            SessionExit::Failed(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("expected a failed exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn process_launcher_terminates_child_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-server");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        set_executable(&script);

        let launcher = ProcessLauncher::new(&script, false);
        let (tx, rx) = watch::channel(false);
        let candidate = Candidate::new("/dev/sdb1", dir.path());
        let launch = tokio::spawn(async move { launcher.launch(&candidate, rx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(10), launch)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, SessionExit::Terminated);
    }

    #[tokio::test]
    async fn task_launcher_serves_candidate_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        std::fs::write(&image, vec![0u8; 64 * 512]).unwrap();

        let mut config = Config::default();
        config.server.address = "127.0.0.1:0".to_string();
        config.server.broadcast = false;
        let launcher = TaskLauncher::new(config);
        let (tx, rx) = watch::channel(false);
        let candidate = Candidate::new(&image, dir.path());
        let launch = tokio::spawn(async move { launcher.launch(&candidate, rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        assert_eq!(launch.await.unwrap().unwrap(), SessionExit::Terminated);
    }

    #[tokio::test]
    async fn task_launcher_reports_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.address = "127.0.0.1:0".to_string();
        let launcher = TaskLauncher::new(config);
        let (_tx, rx) = watch::channel(false);
        let result = launcher
            .launch(&Candidate::new(dir.path().join("missing"), dir.path()), rx)
            .await;
        assert!(matches!(result, Err(MonitorError::Session { .. })));
    }

    fn set_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }
}
