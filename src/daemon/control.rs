//! Operator mode routing.
//!
//! Each mode maps to an injected handler so the CLI, tests and embedders can
//! swap implementations without touching the routing itself.

use std::collections::BTreeMap;
use std::fmt;

use super::DaemonError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mode {
    Start,
    Stop,
    Status,
    Run,
    ForceRun,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Start => "start",
            Mode::Stop => "stop",
            Mode::Status => "status",
            Mode::Run => "run",
            Mode::ForceRun => "force-run",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handles one mode. `include_optional` is passed through unchanged.
pub trait ModeHandler {
    fn handle(&self, include_optional: bool) -> crate::Result<()>;
}

impl<F> ModeHandler for F
where
    F: Fn(bool) -> crate::Result<()>,
{
    fn handle(&self, include_optional: bool) -> crate::Result<()> {
        self(include_optional)
    }
}

#[derive(Default)]
pub struct Dispatcher<'a> {
    handlers: BTreeMap<Mode, Box<dyn ModeHandler + 'a>>,
}

impl<'a> Dispatcher<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, mode: Mode, handler: impl ModeHandler + 'a) -> Self {
        self.handlers.insert(mode, Box::new(handler));
        self
    }

    pub fn dispatch(&self, mode: Mode, include_optional: bool) -> crate::Result<()> {
        let handler = self
            .handlers
            .get(&mode)
            .ok_or(DaemonError::NoHandler(mode))?;
        tracing::debug!(%mode, include_optional, "dispatching");
        handler.handle(include_optional)
    }
}
