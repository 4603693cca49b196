pub mod app;
pub mod channel;
pub mod isolation;
pub mod logger;
pub mod prompt;
pub mod settings;
pub mod watcher;
pub mod workflow;
