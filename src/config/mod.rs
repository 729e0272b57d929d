mod server;

pub use server::{AgentConfig, AuthConfig, OperationLogConfig, QueueConfig, ServerConfig};
