//! One authenticated ClientQuery connection.
//!
//! Every write registers a response slot under the write lock, so status
//! lines are attributed to commands in send order no matter which task
//! issued them. Slots registered by the keepalive or by fire-and-forget
//! sends are discarded when their status arrives; the receive side only
//! waits on slots it registered itself through [`QueryConnection::request`].

use crate::protocol::{
    parse_records, Notification, QueryCommand, QueryLine, Record, Status,
};
use crate::transport::{LineReader, LineTransport, LineWriter, TransportError};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

const MAX_GREETING_LINES: usize = 8;
const GREETING_MARKER: &str = "TS3";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("query failed with id={id}: {msg}")]
    Status { id: u32, msg: String },
}

impl QueryError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(err) => err.kind(),
            Self::Status { .. } => "query_status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseSlot {
    Collect,
    Discard(&'static str),
}

struct WriterState {
    writer: LineWriter,
    last_keepalive: Option<DateTime<Utc>>,
}

/// Shared write side. Cloned into the keepalive task.
#[derive(Clone)]
pub struct CommandSender {
    writer: Arc<Mutex<WriterState>>,
    slots: Arc<StdMutex<VecDeque<ResponseSlot>>>,
}

impl CommandSender {
    fn new(writer: LineWriter) -> Self {
        Self {
            writer: Arc::new(Mutex::new(WriterState {
                writer,
                last_keepalive: None,
            })),
            slots: Arc::new(StdMutex::new(VecDeque::new())),
        }
    }

    async fn send(&self, command: &QueryCommand, slot: ResponseSlot) -> Result<(), TransportError> {
        let mut state = self.writer.lock().await;
        self.lock_slots().push_back(slot);
        state.writer.send_line(&command.to_line()).await
    }

    /// Sends a command whose status is only logged.
    pub async fn send_discarded(
        &self,
        command: &QueryCommand,
        label: &'static str,
    ) -> Result<(), TransportError> {
        self.send(command, ResponseSlot::Discard(label)).await
    }

    pub async fn send_keepalive(&self) -> Result<(), TransportError> {
        let mut state = self.writer.lock().await;
        self.lock_slots().push_back(ResponseSlot::Discard("keepalive"));
        state
            .writer
            .send_line(&QueryCommand::whoami().to_line())
            .await?;
        state.last_keepalive = Some(Utc::now());
        Ok(())
    }

    pub async fn last_keepalive(&self) -> Option<DateTime<Utc>> {
        self.writer.lock().await.last_keepalive
    }

    pub async fn close(&self) {
        self.writer.lock().await.writer.close().await;
    }

    fn pop_slot(&self) -> Option<ResponseSlot> {
        self.lock_slots().pop_front()
    }

    fn lock_slots(&self) -> MutexGuard<'_, VecDeque<ResponseSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub lines: Vec<String>,
}

impl Response {
    pub fn records(&self) -> Vec<Record> {
        self.lines.iter().flat_map(|line| parse_records(line)).collect()
    }
}

enum Absorbed {
    Response(Response),
    Notification(Notification),
    Nothing,
}

pub struct QueryConnection {
    reader: LineReader,
    sender: CommandSender,
    backlog: VecDeque<Notification>,
    collected: Vec<String>,
    authenticated: bool,
    own_client_id: Option<u32>,
}

impl QueryConnection {
    /// Consumes the greeting banner up to the `selected` line.
    pub async fn open(transport: LineTransport) -> Result<Self, TransportError> {
        let (reader, writer) = transport.into_split();
        let mut connection = Self {
            reader,
            sender: CommandSender::new(writer),
            backlog: VecDeque::new(),
            collected: Vec::new(),
            authenticated: false,
            own_client_id: None,
        };
        connection.read_greeting().await?;
        Ok(connection)
    }

    async fn read_greeting(&mut self) -> Result<(), TransportError> {
        let banner = self.reader.receive_line().await?;
        if !banner.contains(GREETING_MARKER) {
            return Err(TransportError::Network(format!(
                "unexpected greeting: {banner}"
            )));
        }
        for _ in 1..MAX_GREETING_LINES {
            let line = self.reader.receive_line().await?;
            if let QueryLine::Selected(fields) = QueryLine::classify(&line) {
                debug!(
                    event = "query_greeting_done",
                    schandlerid = fields.get("schandlerid").map(String::as_str).unwrap_or("")
                );
                return Ok(());
            }
        }
        Err(TransportError::Network(
            "greeting did not select a server connection".to_string(),
        ))
    }

    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn own_client_id(&self) -> Option<u32> {
        self.own_client_id
    }

    /// Sends `command` and waits for its status. Notifications that arrive
    /// meanwhile are kept for [`Self::next_notification`].
    pub async fn request(&mut self, command: &QueryCommand) -> Result<Response, QueryError> {
        if let Err(err) = self.sender.send(command, ResponseSlot::Collect).await {
            return Err(self.fail(err).into());
        }
        loop {
            let line = match self.reader.receive_line().await {
                Ok(line) => line,
                Err(err) => return Err(self.fail(err).into()),
            };
            match self.absorb(&line) {
                Absorbed::Response(response) if response.status.is_ok() => return Ok(response),
                Absorbed::Response(response) => {
                    debug!(
                        event = "query_status_error",
                        command = command.name(),
                        id = response.status.id,
                        msg = %response.status.msg
                    );
                    return Err(QueryError::Status {
                        id: response.status.id,
                        msg: response.status.msg,
                    });
                }
                Absorbed::Notification(notification) => self.backlog.push_back(notification),
                Absorbed::Nothing => {}
            }
        }
    }

    pub async fn authenticate(&mut self, api_key: &str) -> Result<(), QueryError> {
        self.authenticated = false;
        self.request(&QueryCommand::auth(api_key)).await?;
        self.authenticated = true;
        info!(event = "query_authenticated");
        Ok(())
    }

    pub async fn subscribe_text_messages(&mut self, schandler_id: u32) -> Result<(), QueryError> {
        self.request(&QueryCommand::register_text_messages(schandler_id))
            .await?;
        Ok(())
    }

    /// Learns the bot's own client id. A status error (not connected to a
    /// server yet) leaves it unknown.
    pub async fn identify(&mut self) -> Result<Option<u32>, TransportError> {
        match self.request(&QueryCommand::whoami()).await {
            Ok(response) => {
                self.own_client_id = response
                    .records()
                    .first()
                    .and_then(|record| record.get("clid"))
                    .and_then(|clid| clid.parse().ok());
            }
            Err(QueryError::Status { id, msg }) => {
                debug!(event = "query_whoami_unavailable", id, msg = %msg);
                self.own_client_id = None;
            }
            Err(QueryError::Transport(err)) => return Err(err),
        }
        Ok(self.own_client_id)
    }

    /// Blocks until the next notification. Cancel safe.
    pub async fn next_notification(&mut self) -> Result<Notification, TransportError> {
        if let Some(notification) = self.backlog.pop_front() {
            return Ok(notification);
        }
        loop {
            let line = match self.reader.receive_line().await {
                Ok(line) => line,
                Err(err) => return Err(self.fail(err)),
            };
            if let Absorbed::Notification(notification) = self.absorb(&line) {
                return Ok(notification);
            }
        }
    }

    /// Reads up to `max_lines` raw lines, each bounded by `per_line`.
    /// Notifications read here are not dispatched.
    pub async fn drain_lines(
        &mut self,
        max_lines: usize,
        per_line: Duration,
    ) -> Result<Vec<String>, TransportError> {
        let mut seen = Vec::new();
        while seen.len() < max_lines {
            let line = match self.reader.receive_line_within(per_line).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => return Err(self.fail(err)),
            };
            if let Absorbed::Notification(notification) = self.absorb(&line) {
                debug!(event = "query_notification_skipped", kind = %notification.event);
            }
            seen.push(line);
        }
        Ok(seen)
    }

    pub async fn send(
        &mut self,
        command: &QueryCommand,
        label: &'static str,
    ) -> Result<(), TransportError> {
        match self.sender.send_discarded(command, label).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    pub async fn close(&mut self) {
        self.authenticated = false;
        self.sender.close().await;
    }

    fn fail(&mut self, err: TransportError) -> TransportError {
        self.authenticated = false;
        err
    }

    fn absorb(&mut self, line: &str) -> Absorbed {
        match QueryLine::classify(line) {
            QueryLine::Status(status) => {
                let lines = std::mem::take(&mut self.collected);
                match self.sender.pop_slot() {
                    Some(ResponseSlot::Collect) => Absorbed::Response(Response { status, lines }),
                    Some(ResponseSlot::Discard(label)) => {
                        if !status.is_ok() {
                            debug!(
                                event = "query_discarded_status",
                                command = label,
                                id = status.id,
                                msg = %status.msg
                            );
                        }
                        Absorbed::Nothing
                    }
                    None => {
                        debug!(event = "query_unsolicited_status", id = status.id);
                        Absorbed::Nothing
                    }
                }
            }
            QueryLine::Notification(notification) => Absorbed::Notification(notification),
            QueryLine::Selected(_) => Absorbed::Nothing,
            QueryLine::Data(text) => {
                self.collected.push(text);
                Absorbed::Nothing
            }
        }
    }
}
