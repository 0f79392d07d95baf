use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::address::SimulatorAddress;
use crate::config::types::ConfigFile;
use crate::config::{ConnectionSettings, WorkerSettings, write_config_file};
use crate::error::{AppResult, ProcessError};
use crate::failure::{ExitOutcome, MarkerWriter, ProcessHandle};
use crate::phases::TestFactory;
use crate::system::shutdown::{ShutdownSender, request_shutdown, shutdown_channel};
use crate::worker::{WorkerLaunch, run_worker};

pub const WORKER_CONFIG_FILE: &str = "worker.toml";
const WORKER_STDOUT_FILE: &str = "worker.out";
const WORKER_STDERR_FILE: &str = "worker.err";

/// One worker the agent was asked to start.
#[derive(Debug, Clone)]
pub struct WorkerSpawn {
    pub address: SimulatorAddress,
    pub directory: PathBuf,
    pub agent_endpoint: String,
    pub connection: ConnectionSettings,
    pub settings: WorkerSettings,
}

impl WorkerSpawn {
    fn launch(&self) -> WorkerLaunch {
        WorkerLaunch {
            address: self.address,
            agent_endpoint: self.agent_endpoint.clone(),
            home: self.directory.clone(),
            connection: self.connection.clone(),
            settings: self.settings.clone(),
            markers: Arc::new(MarkerWriter::new(self.directory.clone())),
        }
    }
}

/// Starts worker processes (or their in-process stand-ins).
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the worker cannot be started.
    async fn launch(&self, spawn: &WorkerSpawn) -> AppResult<Box<dyn ProcessHandle>>;
}

/// Runs `<binary> worker ...` with the worker directory as its working
/// directory and its output captured next to the markers.
pub struct ProcessLauncher {
    binary: PathBuf,
}

impl ProcessLauncher {
    /// Uses `binary`, or the running executable when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the running executable cannot be resolved.
    pub fn new(binary: Option<PathBuf>) -> Result<Self, ProcessError> {
        let binary = match binary {
            Some(binary) => binary,
            None => std::env::current_exe().map_err(|source| ProcessError::WorkerBinary { source })?,
        };
        Ok(Self { binary })
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spawn: &WorkerSpawn) -> AppResult<Box<dyn ProcessHandle>> {
        let config_path = spawn.directory.join(WORKER_CONFIG_FILE);
        let config = ConfigFile {
            connection: Some(spawn.connection.to_config()),
            worker: Some(spawn.settings.to_config()),
            ..ConfigFile::default()
        };
        write_config_file(&config_path, &config)?;
        let stdout = output_file(&spawn.directory, WORKER_STDOUT_FILE)?;
        let stderr = output_file(&spawn.directory, WORKER_STDERR_FILE)?;

        let child = Command::new(&self.binary)
            .arg("worker")
            .arg("--address")
            .arg(spawn.address.to_string())
            .arg("--agent")
            .arg(&spawn.agent_endpoint)
            .arg("--home")
            .arg(&spawn.directory)
            .arg("--config")
            .arg(&config_path)
            .current_dir(&spawn.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                address: spawn.address.to_string(),
                source,
            })?;
        info!(
            "Spawned worker {} (pid {:?}) in {}",
            spawn.address,
            child.id(),
            spawn.directory.display()
        );
        Ok(Box::new(child))
    }
}

fn output_file(directory: &Path, name: &str) -> Result<File, ProcessError> {
    let path = directory.join(name);
    File::create(&path).map_err(|source| ProcessError::WorkerDirectory { path, source })
}

/// Runs workers as tasks of the agent's own runtime. Used for single-host
/// fleets and tests.
pub struct InProcessLauncher {
    factory: Arc<dyn TestFactory>,
}

impl InProcessLauncher {
    #[must_use]
    pub fn new(factory: Arc<dyn TestFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, spawn: &WorkerSpawn) -> AppResult<Box<dyn ProcessHandle>> {
        let (shutdown_tx, _) = shutdown_channel();
        let launch = spawn.launch();
        let address = spawn.address;
        let task = tokio::spawn(run_worker(launch, self.factory.clone(), shutdown_tx.clone()));
        debug!("Started in-process worker {}", address);
        Ok(Box::new(InProcessWorker {
            task: Some(task),
            shutdown_tx,
        }))
    }
}

struct InProcessWorker {
    task: Option<JoinHandle<AppResult<()>>>,
    shutdown_tx: ShutdownSender,
}

impl ProcessHandle for InProcessWorker {
    fn poll_exit(&mut self) -> std::io::Result<Option<ExitOutcome>> {
        let Some(task) = self.task.as_mut() else {
            return Ok(None);
        };
        if !task.is_finished() {
            return Ok(None);
        }
        let outcome = match task.now_or_never() {
            Some(Ok(Ok(()))) => ExitOutcome {
                code: Some(0),
                success: true,
            },
            Some(Ok(Err(err))) => {
                debug!("In-process worker failed: {}", err);
                ExitOutcome {
                    code: Some(1),
                    success: false,
                }
            }
            Some(Err(_)) | None => ExitOutcome {
                code: None,
                success: false,
            },
        };
        self.task = None;
        Ok(Some(outcome))
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        if !request_shutdown(&self.shutdown_tx) {
            // Worker already finished.
        }
        Ok(())
    }
}

/// Creates (or reuses) the worker directory below `home` and returns its
/// absolute path; spawned workers run with it as their working directory.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn prepare_worker_directory(home: &Path, address: SimulatorAddress) -> Result<PathBuf, ProcessError> {
    let directory = home.join(address.to_string());
    fs::create_dir_all(&directory).map_err(|source| ProcessError::WorkerDirectory {
        path: directory.clone(),
        source,
    })?;
    fs::canonicalize(&directory).map_err(|source| ProcessError::WorkerDirectory {
        path: directory,
        source,
    })
}
