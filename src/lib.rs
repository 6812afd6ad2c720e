//! Userscript manager core: stores scripts, keeps remote ones up to date,
//! resolves their order and injects them into a page's own JavaScript realm.

pub mod commands;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fetcher;
pub mod host;
pub mod injection;
pub mod manager;
pub mod metadata;
pub mod model;
pub mod resolver;
pub mod storage;
pub mod store;
pub mod syntax;
pub mod updater;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use manager::ScriptManager;
pub use model::{ScriptId, ScriptRecord};
