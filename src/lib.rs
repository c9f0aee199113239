pub mod apps;
pub mod bots;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod dialog;
pub mod engine;
pub mod error;
pub mod event;
pub mod hooks;
pub mod http;
pub mod logger;
pub mod orchestrator;
pub mod store;
pub mod watcher;
