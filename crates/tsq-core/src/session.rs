//! Connection lifecycle: connect, authenticate, subscribe, listen, and
//! recover from every failure except a rejected API key.

use crate::actions::ActionExecutor;
use crate::config::{BotConfig, ReconnectPolicy};
use crate::connection::{CommandSender, QueryConnection, QueryError};
use crate::dispatch::CommandDispatcher;
use crate::protocol::{Notification, QueryCommand, TextMessage};
use crate::supervisor::ClientProcess;
use crate::transport::{Connector, TransportError};
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Consecutive restart failures after which each further failure is
/// flagged as persistent.
const PERSISTENT_RESTART_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Listening,
    Reconnecting,
    Restarting,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Subscribing => "subscribing",
            Self::Listening => "listening",
            Self::Reconnecting => "reconnecting",
            Self::Restarting => "restarting",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("api key rejected (id={id}): {msg}")]
    AuthRejected { id: u32, msg: String },
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthRejected { .. } => "auth_rejected",
        }
    }
}

enum Attempt {
    Shutdown,
    Retry,
}

enum ListenExit {
    Shutdown,
    Failed(TransportError),
}

pub struct Session<C, P, D> {
    config: BotConfig,
    connector: C,
    process: Arc<P>,
    dispatcher: D,
    actions: ActionExecutor,
    state: watch::Sender<SessionState>,
}

impl<C, P, D> Session<C, P, D>
where
    C: Connector,
    P: ClientProcess,
    D: CommandDispatcher,
{
    pub fn new(config: BotConfig, connector: C, process: Arc<P>, dispatcher: D) -> Self {
        let actions = ActionExecutor::new(&config);
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            connector,
            process,
            dispatcher,
            actions,
            state,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Runs until `shutdown` flips to true (or its sender goes away).
    /// Returns an error only when the API key is rejected.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        let mut backoff = Backoff::new(self.config.reconnect);
        let mut restart_failures = 0u32;
        while !*shutdown.borrow() {
            match self
                .attempt(&mut shutdown, &mut backoff, &mut restart_failures)
                .await?
            {
                Attempt::Shutdown => break,
                Attempt::Retry => {}
            }
            let delay = backoff.next_delay();
            debug!(event = "session_retry_scheduled", delay_ms = delay.as_millis() as u64);
            if !pause(delay, &mut shutdown).await {
                break;
            }
        }
        self.set_state(SessionState::Disconnected);
        info!(event = "session_stopped");
        Ok(())
    }

    async fn attempt(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
        restart_failures: &mut u32,
    ) -> Result<Attempt, SessionError> {
        let timeout = self.config.connect_timeout;
        self.set_state(SessionState::Connecting);
        let transport = match self.connector.connect(&self.config.addr, timeout).await {
            Ok(transport) => transport,
            Err(err) if err.is_refused() && self.process.is_managed() => {
                self.leave(SessionState::Connecting, SessionState::Restarting, err.kind(), &err);
                self.restart_client(restart_failures).await;
                return Ok(Attempt::Retry);
            }
            Err(err) => {
                self.leave(SessionState::Connecting, SessionState::Reconnecting, err.kind(), &err);
                return Ok(Attempt::Retry);
            }
        };

        let mut connection = match tokio::time::timeout(timeout, QueryConnection::open(transport)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(err)) => {
                self.leave(SessionState::Connecting, SessionState::Reconnecting, err.kind(), &err);
                return Ok(Attempt::Retry);
            }
            Err(_) => {
                let err = TransportError::ConnectionTimeout(timeout);
                self.leave(SessionState::Connecting, SessionState::Reconnecting, err.kind(), &err);
                return Ok(Attempt::Retry);
            }
        };

        self.set_state(SessionState::Authenticating);
        let authenticated = tokio::time::timeout(timeout, connection.authenticate(&self.config.api_key)).await;
        match flatten_timeout(authenticated, timeout) {
            Ok(()) => {}
            Err(QueryError::Status { id, msg }) => {
                connection.close().await;
                self.set_state(SessionState::Disconnected);
                error!(event = "session_auth_rejected", id, msg = %msg);
                return Err(SessionError::AuthRejected { id, msg });
            }
            Err(err) => {
                connection.close().await;
                self.leave(SessionState::Authenticating, SessionState::Reconnecting, err.kind(), &err);
                return Ok(Attempt::Retry);
            }
        }

        self.set_state(SessionState::Subscribing);
        let schandler_id = self.config.schandler_id;
        let subscribed = tokio::time::timeout(timeout, async {
            connection.subscribe_text_messages(schandler_id).await?;
            connection.identify().await.map_err(QueryError::from)
        })
        .await;
        let own_client_id = match flatten_timeout(subscribed, timeout) {
            Ok(own_client_id) => own_client_id,
            Err(err) => {
                connection.close().await;
                self.leave(SessionState::Subscribing, SessionState::Reconnecting, err.kind(), &err);
                return Ok(Attempt::Retry);
            }
        };

        backoff.reset();
        self.set_state(SessionState::Listening);
        info!(
            event = "session_listening",
            addr = %self.config.addr,
            own_client_id = ?own_client_id
        );
        let exit = self.listen(&mut connection, shutdown).await;
        let last_keepalive = connection.sender().last_keepalive().await;
        connection.close().await;
        match exit {
            ListenExit::Shutdown => Ok(Attempt::Shutdown),
            ListenExit::Failed(err) => {
                debug!(event = "session_listen_failed", last_keepalive = ?last_keepalive);
                self.leave(SessionState::Listening, SessionState::Reconnecting, err.kind(), &err);
                Ok(Attempt::Retry)
            }
        }
    }

    /// Receive duty in this task, keepalive duty in a spawned one. The
    /// first transport failure from either ends listening.
    async fn listen(
        &self,
        connection: &mut QueryConnection,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ListenExit {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (failure_tx, mut failure_rx) = mpsc::channel::<TransportError>(1);
        let keepalive = tokio::spawn(keepalive_loop(
            connection.sender(),
            self.config.keepalive_interval,
            stop_rx,
            failure_tx,
        ));

        // Both the wait for the next event and the handling of it (which may
        // block on a query response) stay raced against shutdown and
        // keepalive failure. Dropping either future mid-read is cancel safe.
        let exit = loop {
            let notification = tokio::select! {
                _ = shutdown_requested(shutdown) => break ListenExit::Shutdown,
                Some(err) = failure_rx.recv() => break ListenExit::Failed(err),
                received = connection.next_notification() => match received {
                    Ok(notification) => notification,
                    Err(err) => break ListenExit::Failed(err),
                },
            };
            tokio::select! {
                _ = shutdown_requested(shutdown) => {
                    debug!(event = "session_handling_cancelled");
                    break ListenExit::Shutdown;
                }
                Some(err) = failure_rx.recv() => break ListenExit::Failed(err),
                handled = self.handle_notification(connection, notification) => {
                    if let Err(err) = handled {
                        break ListenExit::Failed(err);
                    }
                }
            }
        };

        let _ = stop_tx.send(true);
        if let Err(err) = keepalive.await {
            warn!(event = "session_keepalive_join_failed", error = %err);
        }
        exit
    }

    async fn handle_notification(
        &self,
        connection: &mut QueryConnection,
        notification: Notification,
    ) -> Result<(), TransportError> {
        let Some(message) = TextMessage::from_notification(&notification) else {
            debug!(event = "session_notification_ignored", kind = %notification.event);
            return Ok(());
        };
        if message.invoker_id.is_some() && message.invoker_id == connection.own_client_id() {
            return Ok(());
        }
        info!(event = "session_text_message", sender = %message.sender, msg = %message.msg);

        let dispatch = self.dispatcher.dispatch(&message.msg, &message.sender);
        let mut reply = dispatch.reply;
        for action in &dispatch.actions {
            if let Some(text) = self.actions.execute(connection, action).await? {
                reply = Some(text);
            }
        }
        if let Some(text) = reply {
            connection
                .send(&QueryCommand::send_text(message.reply_target(), &text), "reply")
                .await?;
        }
        Ok(())
    }

    async fn restart_client(&self, failures: &mut u32) {
        match self.process.restart().await {
            Ok(outcome) => {
                *failures = 0;
                info!(event = "session_client_restarted", outcome = ?outcome);
            }
            Err(err) => {
                *failures += 1;
                warn!(
                    event = "session_client_restart_failed",
                    kind = err.kind(),
                    failures = *failures,
                    persistent = *failures >= PERSISTENT_RESTART_FAILURES,
                    error = %err
                );
            }
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(event = "session_state", from = %previous, to = %next);
        }
    }

    fn leave(&self, from: SessionState, to: SessionState, kind: &str, error: &dyn fmt::Display) {
        warn!(
            event = "session_transition",
            from = %from,
            to = %to,
            kind,
            error = %error
        );
        self.set_state(to);
    }
}

async fn keepalive_loop(
    sender: CommandSender,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
    failures: mpsc::Sender<TransportError>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                if let Err(err) = sender.send_keepalive().await {
                    let _ = failures.send(err).await;
                    break;
                }
                debug!(event = "session_keepalive_sent");
            }
        }
    }
}

/// False when shutdown was requested while waiting.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

/// Resolves once shutdown is requested or its sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn flatten_timeout<T>(
    result: Result<Result<T, QueryError>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> Result<T, QueryError> {
    match result {
        Ok(inner) => inner,
        Err(_) => Err(TransportError::ConnectionTimeout(timeout).into()),
    }
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current: policy.initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_backoff(self.current, self.policy.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}
