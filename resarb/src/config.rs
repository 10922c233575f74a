//! Environment-driven configuration.
//!
//! Two knobs are read from the process environment, each exactly once:
//! `RESARB_BUS` selects the bus endpoint and `RESARB_DEBUG` is a one-shot
//! debug-log toggle.

use std::sync::OnceLock;

/// Which message bus the client should attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusKind {
    /// The per-login session bus.
    #[default]
    Session,
    /// The system-wide bus.
    System,
}

impl BusKind {
    /// Read `RESARB_BUS` ("session" or "system"); anything else, or an
    /// unset variable, selects the session bus.
    pub fn from_env() -> Self {
        static KIND: OnceLock<BusKind> = OnceLock::new();
        *KIND.get_or_init(|| match std::env::var("RESARB_BUS").as_deref() {
            Ok("system") => BusKind::System,
            _ => BusKind::Session,
        })
    }
}

/// Whether `RESARB_DEBUG` asks for debug logging.
///
/// The variable is parsed once as a non-negative integer; any positive value
/// turns the toggle on.
pub fn debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var("RESARB_DEBUG")
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .map(|value| value > 0)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_is_the_default_bus() {
        assert_eq!(BusKind::default(), BusKind::Session);
    }
}
