pub mod config;
pub mod connection;
pub mod error;
pub mod frames;
pub mod hub;
pub mod poll;
pub mod progress;
pub mod protocol;
pub mod store;
pub mod telemetry;
pub mod timeline;

pub use config::SyncConfig;
pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState};
pub use error::{SyncError, TerminalStudyError};
pub use hub::{ChangeStream, HubOptions, StudyHub, StudyWatch};
pub use progress::StudyPhase;
pub use protocol::PushEvent;
pub use store::{LiveStore, SessionView, StoreChange, StudyView};
