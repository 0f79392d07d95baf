use std::ffi::OsStr;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Kills the wrapped process when dropped.
pub struct ChildGuard(pub Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let child = &mut self.0;
        if child.try_wait().ok().flatten().is_none() {
            drop(child.kill());
            drop(child.wait());
        }
    }
}

/// Spawn the `fleetsim` binary with logs discarded.
///
/// # Errors
///
/// Returns an error if the binary is missing or fails to start.
pub fn spawn_fleetsim<I, S>(args: I) -> Result<Child, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let bin = fleetsim_bin()?;
    let mut command = Command::new(bin);
    command.args(args).env("FLEETSIM_LOG", "error");
    command.stdout(Stdio::null()).stderr(Stdio::null());
    command
        .spawn()
        .map_err(|err| format!("spawn fleetsim failed: {}", err))
}

/// Polls `child` until it exits; kills it once `timeout` has passed.
///
/// # Errors
///
/// Returns an error if polling fails or the process outlives `timeout`.
pub fn wait_for_exit(child: &mut Child, timeout: Duration) -> Result<ExitStatus, String> {
    let deadline = Instant::now().checked_add(timeout);
    while deadline.is_none_or(|limit| Instant::now() < limit) {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => sleep(POLL_INTERVAL),
            Err(err) => return Err(format!("polling fleetsim failed: {}", err)),
        }
    }
    drop(child.kill());
    Err(format!("fleetsim still running after {:?}", timeout))
}

/// Wait until something accepts connections on `endpoint`.
///
/// # Errors
///
/// Returns an error if nothing listens before the timeout.
pub fn wait_for_listener(endpoint: &str, timeout: Duration) -> Result<(), String> {
    let deadline = Instant::now().checked_add(timeout);
    while TcpStream::connect(endpoint).is_err() {
        if deadline.is_some_and(|limit| Instant::now() >= limit) {
            return Err(format!("nothing listening on {}", endpoint));
        }
        sleep(POLL_INTERVAL);
    }
    Ok(())
}

/// Reserves a loopback port by binding and releasing it.
///
/// # Errors
///
/// Returns an error if the OS hands out no port.
pub fn pick_port() -> Result<u16, String> {
    let probe = TcpListener::bind(("127.0.0.1", 0)).map_err(|err| format!("no free port: {}", err))?;
    let addr = probe
        .local_addr()
        .map_err(|err| format!("probe listener has no address: {}", err))?;
    Ok(addr.port())
}

/// Writes a one-agent fleet config running `tests` (TOML table bodies).
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_fleet_config(
    path: &Path,
    endpoint: &str,
    workers_home: &Path,
    tests: &[&str],
) -> Result<(), String> {
    let mut config = format!(
        "[connection]\n\
         connect_attempts = 50\n\
         connect_retry_delay = \"100ms\"\n\
         \n\
         [agent]\n\
         index = 1\n\
         listen = '{endpoint}'\n\
         workers_home = '{home}'\n\
         failure_check_interval = \"50ms\"\n\
         \n\
         [worker]\n\
         performance_interval = \"100ms\"\n\
         heartbeat_interval = \"200ms\"\n\
         \n\
         [coordinator]\n\
         workers_per_agent = 2\n\
         members_per_agent = 1\n\
         phase_poll_interval = \"20ms\"\n\
         phase_timeout = \"20s\"\n\
         run_duration = \"300ms\"\n\
         performance_interval = \"100ms\"\n\
         \n\
         [[coordinator.agents]]\n\
         public = '{endpoint}'\n",
        endpoint = endpoint,
        home = workers_home.display(),
    );
    for test in tests {
        config.push_str("\n[[coordinator.tests]]\n");
        config.push_str(test);
        config.push('\n');
    }
    std::fs::write(path, config).map_err(|err| format!("write config failed: {}", err))
}

fn fleetsim_bin() -> Result<String, String> {
    option_env!("CARGO_BIN_EXE_fleetsim").map_or_else(
        || Err("CARGO_BIN_EXE_fleetsim missing at compile time.".to_owned()),
        |bin| Ok(bin.to_owned()),
    )
}
