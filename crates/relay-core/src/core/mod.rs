//! Core module: UI-agnostic session and chat runtime.
//!
//! This module contains:
//! - `lifecycle`: Agent session state machine with single-flight initialization
//! - `bootstrap`: Config load/migrate/validate/recover cascade
//! - `recipe_gate`: Recipe acceptance, scan, and parameter gating
//! - `chat`: Streaming chat engine and the interrupt protocol
//! - `events`: Chat events published on the bus
//! - `bus`: Process-scoped publish/subscribe
//! - `interrupt`: Ctrl+C handling for front ends
//! - `watchdog`: Bounded hold on resources kept during a stream

pub mod bootstrap;
pub mod bus;
pub mod chat;
pub mod events;
pub mod input_history;
pub mod interrupt;
pub mod lifecycle;
pub mod recipe_gate;
pub mod session;
pub mod tokens;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;
