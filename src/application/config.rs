use serde::{Deserialize, Serialize};

use super::LedgerError;

pub const DEFAULT_CURRENCY: &str = "VND";

/// Platform commission, in basis points of the fare (20%)
pub const DEFAULT_COMMISSION_BPS: u32 = 2_000;

pub const MAX_COMMISSION_BPS: u32 = 10_000;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Currency every wallet and entry is denominated in
    pub currency: String,
    /// Commission taken by the bundled pricing on each settled fare
    pub commission_bps: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency: DEFAULT_CURRENCY.to_string(),
            commission_bps: DEFAULT_COMMISSION_BPS,
        }
    }
}

impl EngineConfig {
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_commission_bps(mut self, commission_bps: u32) -> Self {
        self.commission_bps = commission_bps;
        self
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.commission_bps > MAX_COMMISSION_BPS {
            return Err(LedgerError::InvalidCommissionRate(self.commission_bps));
        }
        if self.currency.trim().is_empty() {
            return Err(LedgerError::InvalidAmount(
                "currency must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.currency, "VND");
        assert_eq!(config.commission_bps, 2_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_commission_above_full_fare_is_rejected() {
        let config = EngineConfig::default().with_commission_bps(10_001);
        assert!(matches!(
            config.validate(),
            Err(LedgerError::InvalidCommissionRate(10_001))
        ));
    }
}
