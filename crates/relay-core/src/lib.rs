//! Core relay library (session lifecycle, chat engine, agent gateway, config).

pub mod config;
pub mod conversation;
pub mod core;
pub mod extension;
pub mod gateway;
pub mod logging;
pub mod recipe;
