#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tsq_core::dispatch::{CommandDispatcher, Dispatch};
use tsq_core::protocol::escape;
use tsq_core::supervisor::{ClientProcess, StartOutcome, SupervisorError};
use tsq_core::transport::{Connector, LineTransport, TransportError};
use tsq_core::{BotConfig, ReconnectPolicy, SessionState};

pub const GOOD_KEY: &str = "good-key";
pub const OWN_CLID: u32 = 1;

const GREETING: &str = "TS3 Client\n\rWelcome to the TeamSpeak 3 ClientQuery interface, type \"help\" for a list of commands.\n\rUse the \"auth\" command to authenticate yourself.\n\rselected schandlerid=1\n\r";
const OK: &str = "error id=0 msg=ok\n\r";

pub fn test_config(api_key: &str) -> BotConfig {
    let mut config = BotConfig::new(api_key);
    config.reconnect = ReconnectPolicy {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(40),
    };
    config.connect_timeout = Duration::from_secs(2);
    config.response_wait_lines = 3;
    config.response_wait_timeout = Duration::from_millis(50);
    config
}

#[derive(Clone, Default)]
pub struct ServerLog {
    lines: Arc<Mutex<Vec<(Instant, String)>>>,
}

impl ServerLog {
    fn push(&self, line: String) {
        self.lines.lock().expect("log lock").push((Instant::now(), line));
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("log lock")
            .iter()
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn stamped(&self) -> Vec<(Instant, String)> {
        self.lines.lock().expect("log lock").clone()
    }

    pub fn contains(&self, line: &str) -> bool {
        self.lines().iter().any(|seen| seen == line)
    }
}

pub enum ServerEvent {
    Line(String),
    HangUp,
}

pub struct ServerSpec {
    log: ServerLog,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    clients: Vec<(u32, String)>,
    reject_subscribe: bool,
    unanswered: Vec<String>,
}

impl ServerSpec {
    /// Logs the command but never answers it.
    pub fn never_answering(mut self, command: &str) -> Self {
        self.unanswered.push(command.to_string());
        self
    }

    pub fn rejecting_subscribe(mut self) -> Self {
        self.reject_subscribe = true;
        self
    }
}

/// Test side of one fake ClientQuery connection.
#[derive(Clone)]
pub struct ServerControl {
    pub log: ServerLog,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerControl {
    pub fn push(&self, line: &str) {
        let _ = self.events.send(ServerEvent::Line(line.to_string()));
    }

    pub fn hang_up(&self) {
        let _ = self.events.send(ServerEvent::HangUp);
    }
}

pub fn fake_server() -> (ServerSpec, ServerControl) {
    let (tx, rx) = mpsc::unbounded_channel();
    let log = ServerLog::default();
    let clients = vec![
        (OWN_CLID, "tsq-bot".to_string()),
        (5, "Alice".to_string()),
        (9, "x3tBot Auroria".to_string()),
    ];
    (
        ServerSpec {
            log: log.clone(),
            events: rx,
            clients,
            reject_subscribe: false,
            unanswered: Vec::new(),
        },
        ServerControl { log, events: tx },
    )
}

async fn serve(stream: DuplexStream, mut spec: ServerSpec) {
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    if writer.write_all(GREETING.as_bytes()).await.is_err() {
        return;
    }
    let mut events_open = true;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    return;
                };
                spec.log.push(line.clone());
                let command = line.split_whitespace().next().unwrap_or("");
                if spec.unanswered.iter().any(|silent| silent == command) {
                    continue;
                }
                let reply = respond(&line, &spec);
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
            event = spec.events.recv(), if events_open => match event {
                Some(ServerEvent::Line(text)) => {
                    if writer.write_all(format!("{text}\n\r").as_bytes()).await.is_err() {
                        return;
                    }
                }
                Some(ServerEvent::HangUp) => return,
                None => events_open = false,
            },
        }
    }
}

fn respond(line: &str, spec: &ServerSpec) -> String {
    let command = line.split_whitespace().next().unwrap_or("");
    match command {
        "auth" if line == format!("auth apikey={GOOD_KEY}") => OK.to_string(),
        "auth" => "error id=2 msg=invalid\\sapikey\n\r".to_string(),
        "clientnotifyregister" if spec.reject_subscribe => {
            "error id=1794 msg=not\\sconnected\n\r".to_string()
        }
        "whoami" => format!("clid={OWN_CLID} cid=1\n\r{OK}"),
        "clientlist" => {
            let records = spec
                .clients
                .iter()
                .map(|(clid, nickname)| {
                    format!(
                        "clid={clid} cid=1 client_database_id={clid} client_nickname={} client_type=0",
                        escape(nickname)
                    )
                })
                .collect::<Vec<_>>()
                .join("|");
            format!("{records}\n\r{OK}")
        }
        _ => OK.to_string(),
    }
}

pub enum Plan {
    Refused,
    Unreachable,
    Serve(ServerSpec),
}

/// Hands out one planned outcome per connect. Clones share the plan.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    plan: Arc<Mutex<VecDeque<Plan>>>,
    attempts: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(plan: Vec<Plan>) -> Self {
        Self {
            plan: Arc::new(Mutex::new(plan.into())),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, addr: &str, _timeout: Duration) -> Result<LineTransport, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.plan.lock().expect("plan lock").pop_front();
        match next {
            Some(Plan::Refused) => Err(TransportError::ConnectionRefused {
                addr: addr.to_string(),
            }),
            Some(Plan::Serve(spec)) => {
                let (client, server) = tokio::io::duplex(64 * 1024);
                tokio::spawn(serve(server, spec));
                Ok(LineTransport::from_stream(client))
            }
            Some(Plan::Unreachable) | None => {
                Err(TransportError::Network("no route to host".to_string()))
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingProcess {
    managed: bool,
    fail: bool,
    restarts: AtomicUsize,
}

impl RecordingProcess {
    pub fn managed() -> Self {
        Self {
            managed: true,
            ..Self::default()
        }
    }

    pub fn unmanaged() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            managed: true,
            fail: true,
            ..Self::default()
        }
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientProcess for RecordingProcess {
    fn is_managed(&self) -> bool {
        self.managed
    }

    async fn restart(&self) -> Result<StartOutcome, SupervisorError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SupervisorError::StartTimeout { attempts: 10 });
        }
        Ok(StartOutcome::Started {
            pid: 4242,
            host_pid: None,
        })
    }
}

#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    reply: Option<String>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingDispatcher {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl CommandDispatcher for RecordingDispatcher {
    fn dispatch(&self, message: &str, sender: &str) -> Dispatch {
        self.calls
            .lock()
            .expect("calls lock")
            .push((message.to_string(), sender.to_string()));
        Dispatch {
            reply: self.reply.clone(),
            actions: Vec::new(),
        }
    }
}

pub async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, target: SessionState) {
    let reached = matches!(
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| *state == target)).await,
        Ok(Ok(_))
    );
    assert!(reached, "session never reached {target}");
}

pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
