use std::io::Write;
use std::path::{Path, PathBuf};

use cluster::audit;
use cluster::config::Settings;
use cluster::driver::serve::serve_plugin;
use cluster::out::Out;
use cluster::reason;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cmd;

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    // Launched by a driver host as an out-of-process driver.
    if machine_rpc::in_plugin_mode() {
        init_logging(0, None);
        let name = std::env::var(machine_rpc::PLUGIN_ENV_DRIVER_NAME).unwrap_or_default();
        return match serve_plugin(&name).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("driver plugin {}: {:#}", name, e);
                reason::exit::PROGRAM_ERROR
            }
        };
    }

    let opts = cmd::Opts::from_args();
    init_logging(opts.verbosity, opts.log_dir.as_deref());
    let settings = match opts.settings() {
        Ok(s) => s,
        Err(e) => return fail(&Out::default(), "", &e),
    };
    let out = settings.out();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let audit_id = match audit::log_command_start(&settings, opts.command.name(), &args).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "failed to record the command in the audit log");
            None
        }
    };

    let token = CancellationToken::new();
    tokio::spawn(watch_signals(token.clone()));
    let res = if opts.command.handles_interrupt() {
        cmd::run(&opts, &settings, token.clone()).await
    } else {
        tokio::select! {
            res = cmd::run(&opts, &settings, token.clone()) => res,
            _ = token.cancelled() => Err(reason::with_kind(reason::INTERRUPTED, anyhow::anyhow!("interrupted"))),
        }
    };

    if let Some(id) = audit_id {
        if let Err(e) = audit::log_command_end(&settings, &id, max_audit_entries(&settings).await).await {
            warn!(error = %e, "failed to update the audit log");
        }
    }

    match res {
        Ok(code) => code,
        Err(e) => fail(&out, &settings.profile_arg(), &e),
    }
}

/// Prints the classified failure and returns its exit code.
fn fail(out: &Out, profile_arg: &str, err: &anyhow::Error) -> i32 {
    let kind = reason::classify(err, reason::host_os());
    debug!(kind = kind.id, error = ?err, "command failed");
    out.failure(&kind, err, &[("profile_arg", profile_arg)]);
    kind.exit_code
}

async fn max_audit_entries(settings: &Settings) -> usize {
    cluster::config::UserConfig::read(&settings.home.config_file())
        .await
        .ok()
        .and_then(|c| c.get("MaxAuditEntries").and_then(|v| v.as_u64()))
        .map(|n| n as usize)
        .unwrap_or(audit::DEFAULT_MAX_ENTRIES)
}

/// Cancels `token` on SIGINT or SIGTERM.
async fn watch_signals(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "installing SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                token.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    debug!("interrupted, cancelling");
    token.cancel();
}

fn level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Appends log lines to `<log_dir>/minikube.log`.
struct LogFile(PathBuf);

impl MakeWriter for LogFile {
    type Writer = Box<dyn Write + Send>;

    fn make_writer(&self) -> Self::Writer {
        match std::fs::OpenOptions::new().create(true).append(true).open(&self.0) {
            Ok(f) => Box::new(f),
            Err(_) => Box::new(std::io::sink()),
        }
    }
}

/// Logs go to stderr, filtered by `RUST_LOG` or else by `-v`, and are
/// copied into `log_dir` when one is given.
fn init_logging(verbosity: u8, log_dir: Option<&Path>) {
    let filter = || match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(level(verbosity)),
    };
    let stderr = fmt::layer().with_writer(std::io::stderr);
    let res = match log_dir.filter(|d| std::fs::create_dir_all(d).is_ok()) {
        Some(dir) => tracing_subscriber::registry()
            .with(filter())
            .with(stderr)
            .with(fmt::layer().with_ansi(false).with_writer(LogFile(dir.join("minikube.log"))))
            .try_init(),
        None => tracing_subscriber::registry().with(filter()).with(stderr).try_init(),
    };
    if let Err(e) = res {
        eprintln!("initializing logging: {}", e);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level(0), "warn");
        assert_eq!(level(1), "info");
        assert_eq!(level(2), "debug");
        assert_eq!(level(7), "trace");
    }

    #[test]
    fn failures_exit_with_their_kind() {
        let err = reason::usage("bad flag");
        assert_eq!(fail(&Out::default(), "", &err), reason::exit::PROGRAM_USAGE);
        let err = anyhow::anyhow!("something unexpected");
        assert_eq!(fail(&Out::default(), "", &err), reason::exit::PROGRAM_ERROR);
    }
}
