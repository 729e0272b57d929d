mod models;
mod operation;
pub mod permission;

pub use models::*;
pub use operation::{MessageType, OperationOutcome, OperationRequest, OperationStatus, StreamMessage};
