//! Resilient TeamSpeak ClientQuery session with supervision of the local
//! client process.

pub mod actions;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod process_table;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use config::{BotConfig, ReconnectPolicy, SupervisorConfig};
pub use dispatch::{ChatCommands, CommandDispatcher, Dispatch};
pub use process_table::SystemProcessTable;
pub use session::{Session, SessionError, SessionState};
pub use supervisor::{ClientProcess, ProcessSupervisor, StartOutcome, SupervisorError};
pub use transport::{Connector, TcpConnector, TransportError};
