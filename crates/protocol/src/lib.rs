pub mod constants;
pub mod envelope;
pub mod presence;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use presence::{OnlineSet, UserId};
