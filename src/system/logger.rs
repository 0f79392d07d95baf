//! Process-wide `tracing` setup shared by the coordinator, agent and worker
//! roles.
use std::io::IsTerminal;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Checked before `RUST_LOG`; the agent forwards it to spawned workers.
pub const LOG_ENV: &str = "FLEETSIM_LOG";

fn default_directives(verbose: bool) -> &'static str {
    if verbose { "fleetsim=debug,info" } else { "info" }
}

fn configured_directives() -> Option<String> {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .filter(|directives| !directives.trim().is_empty())
}

/// Unparseable directives fall back to the verbosity default.
pub(crate) fn resolve_filter(configured: Option<&str>, verbose: bool) -> EnvFilter {
    configured
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directives(verbose)))
}

/// Installs the global subscriber writing to stderr. Only the first call in a
/// process takes effect.
pub fn init_logging(verbose: bool, no_color: bool) {
    let filter = resolve_filter(configured_directives().as_deref(), verbose);
    // Worker stderr is redirected into its directory.
    let ansi = !no_color && std::io::stderr().is_terminal();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(verbose)
        .finish();

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Logging already initialised: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_twice_keeps_first_subscriber() {
        init_logging(false, true);
        init_logging(true, true);
    }

    #[test]
    fn filter_prefers_configured_directives() -> Result<(), String> {
        let filter = resolve_filter(Some("fleetsim::router=trace"), false);
        if filter.to_string() != "fleetsim::router=trace" {
            return Err(format!("Unexpected filter {}", filter));
        }
        Ok(())
    }

    #[test]
    fn invalid_directives_fall_back_to_verbosity() -> Result<(), String> {
        let quiet = resolve_filter(Some("fleetsim=loudest"), false);
        if quiet.to_string() != "info" {
            return Err(format!("Unexpected quiet filter {}", quiet));
        }
        let verbose = resolve_filter(None, true);
        if !verbose.to_string().contains("fleetsim=debug") {
            return Err(format!("Unexpected verbose filter {}", verbose));
        }
        Ok(())
    }
}
