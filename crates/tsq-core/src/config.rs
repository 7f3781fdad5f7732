use std::{fmt, path::PathBuf, time::Duration};

pub const DEFAULT_QUERY_ADDR: &str = "127.0.0.1:25639";
pub const DEFAULT_WATCH_BOT_NICKNAME: &str = "x3tBot Auroria";
pub const DEFAULT_PID_FILE: &str = ".tsclient.pid";
pub const DEFAULT_PROCESS_NAMES: [&str; 2] = ["ts3client", "teamspeak"];

/// Delay between reconnect attempts: starts at `initial`, doubles per
/// failure and never exceeds `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Client argv. Empty means the client is not managed by this process.
    pub launch_command: Vec<String>,
    /// Optional terminal emulator argv prefixed to `launch_command`.
    pub terminal_command: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub pid_file: PathBuf,
    pub process_names: Vec<String>,
    pub discovery_attempts: u32,
    pub discovery_interval: Duration,
    pub stop_grace: Duration,
    pub stop_poll: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            launch_command: Vec::new(),
            terminal_command: Vec::new(),
            workdir: None,
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            process_names: DEFAULT_PROCESS_NAMES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            discovery_attempts: 10,
            discovery_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            stop_poll: Duration::from_millis(200),
        }
    }
}

impl SupervisorConfig {
    pub fn is_managed(&self) -> bool {
        !self.launch_command.is_empty()
    }

    pub fn launch_argv(&self) -> Vec<String> {
        self.terminal_command
            .iter()
            .chain(self.launch_command.iter())
            .cloned()
            .collect()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BotConfig {
    pub addr: String,
    pub api_key: String,
    pub schandler_id: u32,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub watch_bot_nickname: String,
    pub response_wait_lines: usize,
    pub response_wait_timeout: Duration,
    pub supervisor: SupervisorConfig,
}

impl BotConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            addr: DEFAULT_QUERY_ADDR.to_string(),
            api_key: api_key.into(),
            schandler_id: 1,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(3),
            reconnect: ReconnectPolicy::default(),
            watch_bot_nickname: DEFAULT_WATCH_BOT_NICKNAME.to_string(),
            response_wait_lines: 10,
            response_wait_timeout: Duration::from_secs(1),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotConfig")
            .field("addr", &self.addr)
            .field("api_key", &"<redacted>")
            .field("schandler_id", &self.schandler_id)
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("reconnect", &self.reconnect)
            .field("watch_bot_nickname", &self.watch_bot_nickname)
            .field("response_wait_lines", &self.response_wait_lines)
            .field("response_wait_timeout", &self.response_wait_timeout)
            .field("supervisor", &self.supervisor)
            .finish()
    }
}
