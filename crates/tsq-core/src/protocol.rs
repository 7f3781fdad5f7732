//! ClientQuery line grammar: escaping, status lines, notifications and
//! command construction.

use std::collections::BTreeMap;

pub const TEXT_MESSAGE_EVENT: &str = "notifytextmessage";
const STATUS_PREFIX: &str = "error ";
const NOTIFY_PREFIX: &str = "notify";
const SELECTED_PREFIX: &str = "selected";

/// One `key=value` record with values already unescaped.
pub type Record = BTreeMap<String, String>;

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            ' ' => out.push_str("\\s"),
            '|' => out.push_str("\\p"),
            '\u{7}' => out.push_str("\\a"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{b}' => out.push_str("\\v"),
            other => out.push(other),
        }
    }
    out
}

pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('p') => out.push('|'),
            Some('a') => out.push('\u{7}'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\u{b}'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Parses whitespace separated `key=value` tokens. Bare tokens map to "".
pub fn parse_record(segment: &str) -> Record {
    segment
        .split_whitespace()
        .map(|token| match token.split_once('=') {
            Some((key, value)) => (key.to_string(), unescape(value)),
            None => (token.to_string(), String::new()),
        })
        .collect()
}

/// Data lines carry one record per `|` separated segment.
pub fn parse_records(line: &str) -> Vec<Record> {
    line.split('|')
        .map(parse_record)
        .filter(|record| !record.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: u32,
    pub msg: String,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        self.id == 0
    }

    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix(STATUS_PREFIX)?;
        let fields = parse_record(rest);
        let id = fields.get("id")?.parse().ok()?;
        let msg = fields.get("msg").cloned().unwrap_or_default();
        Some(Self { id, msg })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event: String,
    pub fields: Record,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryLine {
    Status(Status),
    Notification(Notification),
    Selected(Record),
    Data(String),
}

impl QueryLine {
    pub fn classify(line: &str) -> Self {
        if let Some(status) = Status::parse(line) {
            return Self::Status(status);
        }
        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
        if head.starts_with(NOTIFY_PREFIX) {
            let first = rest.split('|').next().unwrap_or("");
            return Self::Notification(Notification {
                event: head.to_string(),
                fields: parse_record(first),
            });
        }
        if head == SELECTED_PREFIX {
            return Self::Selected(parse_record(rest));
        }
        Self::Data(line.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTarget {
    Client(u32),
    Channel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub msg: String,
    pub sender: String,
    pub invoker_id: Option<u32>,
}

impl TextMessage {
    pub fn from_notification(notification: &Notification) -> Option<Self> {
        if notification.event != TEXT_MESSAGE_EVENT {
            return None;
        }
        let fields = &notification.fields;
        let msg = fields.get("msg")?.clone();
        let sender = fields
            .get("invokername")
            .or_else(|| fields.get("fromName"))
            .cloned()
            .unwrap_or_default();
        let invoker_id = fields.get("invokerid").and_then(|value| value.parse().ok());
        Some(Self {
            msg,
            sender,
            invoker_id,
        })
    }

    pub fn reply_target(&self) -> ReplyTarget {
        match self.invoker_id {
            Some(clid) => ReplyTarget::Client(clid),
            None => ReplyTarget::Channel,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCommand {
    name: String,
    params: Vec<(String, String)>,
    options: Vec<String>,
}

impl QueryCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn to_line(&self) -> String {
        let mut line = self.name.clone();
        for (key, value) in &self.params {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&escape(value));
        }
        for option in &self.options {
            line.push_str(" -");
            line.push_str(option);
        }
        line
    }

    pub fn auth(api_key: &str) -> Self {
        Self::new("auth").param("apikey", api_key)
    }

    pub fn register_text_messages(schandler_id: u32) -> Self {
        Self::new("clientnotifyregister")
            .param("schandlerid", schandler_id)
            .param("event", TEXT_MESSAGE_EVENT)
    }

    pub fn whoami() -> Self {
        Self::new("whoami")
    }

    pub fn client_list(detailed: bool) -> Self {
        let command = Self::new("clientlist");
        if !detailed {
            return command;
        }
        ["uid", "away", "voice", "times", "groups", "info", "country", "ip"]
            .into_iter()
            .fold(command, |command, option| command.option(option))
    }

    pub fn client_poke(clid: u32, msg: &str) -> Self {
        Self::new("clientpoke").param("clid", clid).param("msg", msg)
    }

    pub fn send_text(target: ReplyTarget, msg: &str) -> Self {
        let command = Self::new("sendtextmessage");
        let command = match target {
            ReplyTarget::Client(clid) => command.param("targetmode", 1).param("target", clid),
            ReplyTarget::Channel => command.param("targetmode", 2),
        };
        command.param("msg", msg)
    }
}
