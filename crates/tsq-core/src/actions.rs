use crate::config::BotConfig;
use crate::connection::{QueryConnection, QueryError};
use crate::dispatch::CommandAction;
use crate::protocol::{QueryCommand, Record, ReplyTarget};
use crate::transport::TransportError;
use std::time::Duration;
use tracing::{info, warn};

/// Runs dispatcher actions against the live connection. A returned string
/// replaces the dispatcher's reply.
#[derive(Debug, Clone)]
pub struct ActionExecutor {
    watch_bot_nickname: String,
    response_wait_lines: usize,
    response_wait_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            watch_bot_nickname: config.watch_bot_nickname.clone(),
            response_wait_lines: config.response_wait_lines,
            response_wait_timeout: config.response_wait_timeout,
        }
    }

    /// Only transport failures are returned; query status errors become a
    /// reply to the sender.
    pub async fn execute(
        &self,
        connection: &mut QueryConnection,
        action: &CommandAction,
    ) -> Result<Option<String>, TransportError> {
        let outcome = match action {
            CommandAction::Broadcast { message } => self.broadcast(connection, message).await,
            CommandAction::AppendWatchList { target } => {
                self.append_watch_list(connection, target).await
            }
            CommandAction::Snapshot => self.snapshot(connection).await,
        };
        match outcome {
            Ok(reply) => Ok(reply),
            Err(QueryError::Status { id, msg }) => {
                warn!(event = "action_failed", action = action.name(), id, msg = %msg);
                Ok(Some(format!("{} failed: {msg} (id {id})", action.name())))
            }
            Err(QueryError::Transport(err)) => Err(err),
        }
    }

    async fn broadcast(
        &self,
        connection: &mut QueryConnection,
        message: &str,
    ) -> Result<Option<String>, QueryError> {
        let clients = connection
            .request(&QueryCommand::client_list(false))
            .await?
            .records();
        let own = connection.own_client_id();
        let mut poked = 0usize;
        for clid in clients.iter().filter_map(client_id) {
            if Some(clid) == own {
                continue;
            }
            connection
                .send(&QueryCommand::client_poke(clid, message), "poke")
                .await?;
            poked += 1;
        }
        info!(event = "action_broadcast", clients = poked);
        Ok(None)
    }

    async fn append_watch_list(
        &self,
        connection: &mut QueryConnection,
        target: &str,
    ) -> Result<Option<String>, QueryError> {
        let clients = connection
            .request(&QueryCommand::client_list(false))
            .await?
            .records();
        let watcher = clients
            .iter()
            .find(|client| {
                client
                    .get("client_nickname")
                    .is_some_and(|nickname| nickname.contains(&self.watch_bot_nickname))
            })
            .and_then(client_id);
        let Some(watcher) = watcher else {
            info!(event = "action_watcher_missing", nickname = %self.watch_bot_nickname);
            return Ok(Some(format!("{} not found", self.watch_bot_nickname)));
        };

        let request = format!("!hunted add {target}");
        connection
            .send(
                &QueryCommand::send_text(ReplyTarget::Client(watcher), &request),
                "watch_list",
            )
            .await?;
        let lines = connection
            .drain_lines(self.response_wait_lines, self.response_wait_timeout)
            .await?;
        for line in &lines {
            info!(event = "action_watch_list_response", line = %line);
        }
        Ok(None)
    }

    async fn snapshot(&self, connection: &mut QueryConnection) -> Result<Option<String>, QueryError> {
        let clients = connection
            .request(&QueryCommand::client_list(true))
            .await?
            .records();
        info!(event = "action_snapshot", clients = clients.len());
        Ok(Some(
            serde_json::to_string(&clients).unwrap_or_else(|_| "[]".to_string()),
        ))
    }
}

fn client_id(record: &Record) -> Option<u32> {
    record.get("clid").and_then(|clid| clid.parse().ok())
}
