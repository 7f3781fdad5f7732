//! Chat commands understood by the bot.

const MASS_POKE: &str = "!mp";
const WATCH_LIST: &str = "!hunted";
const WATCH_LIST_ADD: &str = "add";
const SNAPSHOT: &str = "!snapshot";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    MassPoke { message: String },
    WatchListAdd { target: String },
    Snapshot,
    Unknown { input: String },
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let (verb, rest) = split_word(text);
        match verb {
            MASS_POKE => Self::MassPoke {
                message: rest.to_string(),
            },
            SNAPSHOT if rest.is_empty() => Self::Snapshot,
            WATCH_LIST => match split_word(rest) {
                (WATCH_LIST_ADD, target) if !target.is_empty() => Self::WatchListAdd {
                    target: target.to_string(),
                },
                _ => Self::unknown(text),
            },
            _ => Self::unknown(text),
        }
    }

    fn unknown(text: &str) -> Self {
        Self::Unknown {
            input: text.to_string(),
        }
    }
}

fn split_word(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (text, ""),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    /// Poke every connected client with `message`.
    Broadcast { message: String },
    /// Ask the watcher bot to add `target` to its list.
    AppendWatchList { target: String },
    /// Reply with the full client list.
    Snapshot,
}

impl CommandAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Broadcast { .. } => "broadcast",
            Self::AppendWatchList { .. } => "append_watch_list",
            Self::Snapshot => "snapshot",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub reply: Option<String>,
    pub actions: Vec<CommandAction>,
}

pub trait CommandDispatcher: Send + Sync {
    fn dispatch(&self, message: &str, sender: &str) -> Dispatch;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChatCommands;

impl CommandDispatcher for ChatCommands {
    fn dispatch(&self, message: &str, sender: &str) -> Dispatch {
        match Command::parse(message) {
            Command::MassPoke { message } => Dispatch {
                reply: Some("Poking all clients...".to_string()),
                actions: vec![CommandAction::Broadcast {
                    message: format!("{sender} te cutucou: {message}"),
                }],
            },
            Command::WatchListAdd { target } => Dispatch {
                reply: Some(format!("Added {target} to hunted list.")),
                actions: vec![CommandAction::AppendWatchList { target }],
            },
            Command::Snapshot => Dispatch {
                reply: None,
                actions: vec![CommandAction::Snapshot],
            },
            Command::Unknown { input } => Dispatch {
                reply: Some(format!("Unknown command. Input was: {input}")),
                actions: Vec::new(),
            },
        }
    }
}
