// Infinichat client engine
// Wire framing, session synchronization, conversations, and connection
// lifecycle for the line-delimited JSON chat protocol.

pub mod connection;
pub mod conversation;
pub mod conversations;
pub mod error;
pub mod models;
pub mod protocol;

// Re-export the main types for convenience
pub use connection::{ConnectPolicy, ConnectionEvent, ConnectionManager, DEFAULT_PORT};
pub use conversation::{Conversation, ConversationEvent, Participant};
pub use conversations::{ConversationManager, ConversationManagerEvent};
pub use error::ClientError;
pub use models::*;
pub use protocol::{ChatClient, ClientEvent, SessionPhase};
