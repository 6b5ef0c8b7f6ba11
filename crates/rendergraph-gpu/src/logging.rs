//! Logging handle passed to every GPU component.
//!
//! Components never log through a process-wide logger. Each one receives a
//! [`Logger`] at construction and emits its events as children of that
//! logger's span, so the owning context decides where (and whether) they end
//! up.

use tracing::Span;

/// A cloneable handle to a `tracing` span that scopes a component's events.
#[derive(Clone, Debug)]
pub struct Logger {
    span: Span,
}

impl Logger {
    /// Create a root logger for an application context.
    pub fn new(name: &str) -> Self {
        Self {
            span: tracing::info_span!("rendergraph", context = name),
        }
    }

    /// A logger whose events go nowhere.
    pub fn disabled() -> Self {
        Self {
            span: Span::none(),
        }
    }

    /// Derive the logger for a component owned by this one.
    pub fn child(&self, component: &'static str) -> Self {
        Self {
            span: tracing::debug_span!(parent: &self.span, "component", name = component),
        }
    }

    /// The span events should be parented to.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new("default")
    }
}
