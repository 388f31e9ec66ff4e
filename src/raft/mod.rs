pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;
pub mod transport;

pub use node::{NodeStatus, RaftNode, SubmitResponse};
pub use state::{Action, Command, LogEntry, RaftRole, RaftState};
pub use transport::{LocalNetwork, Transport, TransportError};
