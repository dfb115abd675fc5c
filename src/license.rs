//! License gate consulted once the token count is known.

use crate::error::BurstError;

pub trait LicenseGate: Send + Sync {
    /// Accept or refuse a job that will produce `token_count` documents.
    fn check_limit(&self, token_count: usize) -> Result<(), BurstError>;
}

/// No ceiling.
pub struct Unlimited;

impl LicenseGate for Unlimited {
    fn check_limit(&self, _token_count: usize) -> Result<(), BurstError> {
        Ok(())
    }
}

/// Refuses jobs above a fixed number of documents.
pub struct TokenCeiling(pub usize);

impl LicenseGate for TokenCeiling {
    fn check_limit(&self, token_count: usize) -> Result<(), BurstError> {
        if token_count > self.0 {
            tracing::warn!(token_count, limit = self.0, "License limit exceeded");
            return Err(BurstError::License(format!(
                "{token_count} documents requested, license allows {}",
                self.0
            )));
        }
        Ok(())
    }
}
