//! Log output setup for the CLI and embedding programs
//!
//! `RUST_LOG` always wins over the profile's default filter.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Human-readable, `snapfreeze=info`
    Normal,
    /// Human-readable, `snapfreeze=debug`
    Verbose,
    /// One JSON object per line
    Json,
}

impl Profile {
    pub fn from_flags(verbose: bool, json: bool) -> Self {
        match (json, verbose) {
            (true, _) => Profile::Json,
            (false, true) => Profile::Verbose,
            (false, false) => Profile::Normal,
        }
    }

    fn default_filter(&self) -> &'static str {
        match self {
            Profile::Verbose => "snapfreeze=debug",
            Profile::Normal | Profile::Json => "snapfreeze=info",
        }
    }
}

static INIT_ONCE: Once = Once::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init(profile: Profile) {
    INIT_ONCE.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(profile.default_filter()));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        // another subscriber may already be installed by an embedding program
        let _ = match profile {
            Profile::Json => builder.json().try_init(),
            Profile::Normal | Profile::Verbose => builder.with_target(false).try_init(),
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_idempotent() {
        init(Profile::Normal);
        init(Profile::Json);
    }

    #[test]
    fn test_profile_from_flags() {
        assert_eq!(Profile::from_flags(false, false), Profile::Normal);
        assert_eq!(Profile::from_flags(true, false), Profile::Verbose);
        assert_eq!(Profile::from_flags(true, true), Profile::Json);
        assert_eq!(Profile::Verbose.default_filter(), "snapfreeze=debug");
    }
}
