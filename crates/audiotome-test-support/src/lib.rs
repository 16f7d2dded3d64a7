//! Scripted engine and task fakes for orchestrator tests.

mod fakes;

pub use fakes::{ExchangeScript, ScriptedEngine, ScriptedExchange, ScriptedTask};
