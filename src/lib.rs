pub mod app;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod extract;
pub mod manifest;
pub mod output;
pub mod progress;
pub mod registry;
pub mod store;
pub mod task;
pub mod transfer;
pub mod tui;
pub mod verify;
