use anyhow::{bail, Context, Result};
use clap::Parser;
use std::{
    env,
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use tsq_core::{
    BotConfig, ChatCommands, ProcessSupervisor, ReconnectPolicy, Session, SupervisorConfig,
    SystemProcessTable, TcpConnector,
};

#[derive(Parser, Debug)]
#[command(name = "tsq-bot", about = "TeamSpeak ClientQuery chat bot")]
struct Args {
    #[arg(long, env = "TS3_CLIENTQUERY_ADDR", default_value = "127.0.0.1:25639")]
    addr: String,
    #[arg(long, env = "TS3_CLIENTQUERY_API_KEY", default_value = "", hide_env_values = true)]
    api_key: String,
    #[arg(long, env = "TS3_SCHANDLER_ID", default_value_t = 1)]
    schandler_id: u32,
    #[arg(long, env = "TS3_XBOT_NICKNAME", default_value = "x3tBot Auroria")]
    xbot_nickname: String,
    /// Shell-style command line that launches the client. Empty: unmanaged.
    #[arg(long, env = "TS3_CLIENT_COMMAND", default_value = "")]
    client_command: String,
    /// Terminal emulator prefix, e.g. "xterm -e".
    #[arg(long, env = "TS3_CLIENT_TERMINAL", default_value = "")]
    client_terminal: String,
    #[arg(long, env = "TS3_CLIENT_WORKDIR")]
    client_workdir: Option<PathBuf>,
    #[arg(long, env = "TS3_CLIENT_PID_FILE", default_value = ".tsclient.pid")]
    client_pid_file: PathBuf,
    #[arg(
        long,
        env = "TS3_CLIENT_PROCESS_NAMES",
        default_value = "ts3client,teamspeak",
        value_delimiter = ','
    )]
    client_process_names: Vec<String>,
    #[arg(long, env = "TS3_DISCOVERY_ATTEMPTS", default_value_t = 10)]
    discovery_attempts: u32,
    #[arg(long, env = "TS3_DISCOVERY_INTERVAL", default_value_t = 1.0)]
    discovery_interval: f64,
    #[arg(long, env = "TS3_CONNECT_TIMEOUT", default_value_t = 5.0)]
    connect_timeout: f64,
    #[arg(long, env = "TS3_RECONNECT_DELAY", default_value_t = 1.0)]
    reconnect_delay: f64,
    #[arg(long, env = "TS3_RECONNECT_MAX_DELAY", default_value_t = 10.0)]
    reconnect_max_delay: f64,
    #[arg(long, env = "TS3_KEEPALIVE_INTERVAL", default_value_t = 3.0)]
    keepalive_interval: f64,
    #[arg(long, env = "TS3_RESPONSE_LINES", default_value_t = 10)]
    response_lines: usize,
    #[arg(long, env = "TS3_RESPONSE_TIMEOUT", default_value_t = 1.0)]
    response_timeout: f64,
    #[arg(long, env = "TSQ_LOG_DIR", default_value = "")]
    log_dir: String,
    #[arg(short, long, env = "TSQ_VERBOSE")]
    verbose: bool,
}

struct LogGuard {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

struct MultiWriter {
    file: Option<Arc<StdMutex<std::fs::File>>>,
}

#[tokio::main]
async fn main() {
    // .env must be loaded before clap reads env fallbacks.
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let _log_guard = init_logging(&args.log_dir, args.verbose);

    let config = match load_config(args) {
        Ok(config) => config,
        Err(err) => {
            error!(event = "config_invalid", error = %format!("{err:#}"));
            std::process::exit(2);
        }
    };
    std::process::exit(run(config).await);
}

async fn run(config: BotConfig) -> i32 {
    info!(event = "bot_starting", addr = %config.addr, managed = config.supervisor.is_managed());
    let supervisor = Arc::new(ProcessSupervisor::new(
        config.supervisor.clone(),
        SystemProcessTable::default(),
    ));
    if supervisor.is_managed() {
        match supervisor.adopt_running().await {
            Some(pid) => info!(event = "client_already_running", pid),
            None => {
                if let Err(err) = supervisor.start().await {
                    warn!(event = "client_start_failed", kind = err.kind(), error = %err);
                }
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!(event = "shutdown_requested");
        let _ = shutdown_tx.send(true);
        // Keep the sender alive so the session sees `true`, not a closed channel.
        std::future::pending::<()>().await;
    });

    let session = Session::new(config, TcpConnector, supervisor.clone(), ChatCommands);
    let result = session.run(shutdown_rx).await;
    signal_task.abort();

    if supervisor.is_managed() {
        if let Err(err) = supervisor.stop().await {
            warn!(event = "client_stop_failed", kind = err.kind(), error = %err);
        }
    }

    match result {
        Ok(()) => {
            info!(event = "bot_stopped");
            0
        }
        Err(err) => {
            error!(event = "bot_fatal", kind = err.kind(), error = %err);
            1
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => warn!(event = "sigterm_handler_failed", error = %err),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(event = "ctrl_c_handler_failed", error = %err);
    }
}

fn load_config(args: Args) -> Result<BotConfig> {
    if args.api_key.trim().is_empty() {
        bail!("TS3_CLIENTQUERY_API_KEY is required");
    }
    let launch_command = split_command("TS3_CLIENT_COMMAND", &args.client_command)?;
    let terminal_command = split_command("TS3_CLIENT_TERMINAL", &args.client_terminal)?;
    if !terminal_command.is_empty() && launch_command.is_empty() {
        bail!("TS3_CLIENT_TERMINAL requires TS3_CLIENT_COMMAND");
    }
    let process_names = args
        .client_process_names
        .iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>();
    if process_names.is_empty() {
        bail!("TS3_CLIENT_PROCESS_NAMES must name at least one process");
    }
    if args.discovery_attempts == 0 {
        bail!("TS3_DISCOVERY_ATTEMPTS must be at least 1");
    }

    let reconnect = ReconnectPolicy {
        initial: seconds("TS3_RECONNECT_DELAY", args.reconnect_delay)?,
        max: seconds("TS3_RECONNECT_MAX_DELAY", args.reconnect_max_delay)?,
    };
    if reconnect.max < reconnect.initial {
        bail!("TS3_RECONNECT_MAX_DELAY must not be below TS3_RECONNECT_DELAY");
    }

    let supervisor = SupervisorConfig {
        launch_command,
        terminal_command,
        workdir: args.client_workdir,
        pid_file: args.client_pid_file,
        process_names,
        discovery_attempts: args.discovery_attempts,
        discovery_interval: seconds("TS3_DISCOVERY_INTERVAL", args.discovery_interval)?,
        ..SupervisorConfig::default()
    };

    let mut config = BotConfig::new(args.api_key);
    config.addr = args.addr;
    config.schandler_id = args.schandler_id;
    config.connect_timeout = seconds("TS3_CONNECT_TIMEOUT", args.connect_timeout)?;
    config.keepalive_interval = seconds("TS3_KEEPALIVE_INTERVAL", args.keepalive_interval)?;
    config.reconnect = reconnect;
    config.watch_bot_nickname = args.xbot_nickname;
    config.response_wait_lines = args.response_lines;
    config.response_wait_timeout = seconds("TS3_RESPONSE_TIMEOUT", args.response_timeout)?;
    config.supervisor = supervisor;
    Ok(config)
}

fn split_command(name: &str, raw: &str) -> Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    shlex::split(raw).with_context(|| format!("{name} has unbalanced quoting"))
}

/// Strictly positive seconds.
fn seconds(name: &str, value: f64) -> Result<Duration> {
    if value.is_nan() || value <= 0.0 {
        bail!("{name} must be a positive number of seconds, got {value}");
    }
    Duration::try_from_secs_f64(value).with_context(|| format!("{name} is out of range"))
}

fn init_logging(log_dir: &str, verbose: bool) -> Option<LogGuard> {
    let level = if verbose {
        "debug".to_string()
    } else {
        env::var("TSQ_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter { file: file.clone() });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("tsq-bot.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(StdMutex::new(file))),
    })
}
