//! Configuration module for push-to-talk recording.
//!
//! Provides [`PttConfig`] (all PTT settings), [`PttMode`], [`AppPaths`] for
//! cross-platform config directories, TOML persistence via
//! [`PttConfig::load`] / [`PttConfig::save`], and the `PTT_*` environment
//! overrides.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{PttConfig, PttMode};
