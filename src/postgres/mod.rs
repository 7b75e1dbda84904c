pub mod connection;
pub mod decoder;
pub mod replication;
pub mod session;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use connection::{PgConnection, SimpleRow, SlotCreation, SystemInfo};
pub use decoder::{convert_value, WalDecoder};
pub use replication::{
    ReplicationMessage, ReplicationReader, ReplicationStream, StandbyStatus, StatusWriter,
};
pub use session::{ReplicationPosition, ReplicationSession, SessionEvent, SessionState, WalMessage};
pub use types::*;
