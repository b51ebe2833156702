//! Tracing setup
//!
//! The adapters only emit `tracing` events. Hosts that do not install their
//! own subscriber can call [`init_tracing`].

use tracing_subscriber::EnvFilter;

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Install a JSON subscriber filtered by `config.log_level`
///
/// An unparsable level falls back to `info`. Fails when a global subscriber
/// is already installed.
pub fn init_tracing(config: &Config) -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| Error::Internal(format!("tracing already initialized: {}", e)))?;

    tracing::info!(
        dialect = ?config.dialect,
        prefix = %config.collection_prefix,
        "Tracing initialized for chatbot storage"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_an_error() {
        let config = Config::default();
        // another test may already own the global subscriber
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
