use std::fmt;

use serde::{Deserialize, Serialize};

use super::Money;

/// A fare or settlement amount does not fit in [`Money`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountOverflowError;

impl fmt::Display for AmountOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "amount is too large")
    }
}

impl std::error::Error for AmountOverflowError {}

/// Fare components produced by the pricing collaborator for a completed ride.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FareBreakdown {
    pub base_fare: Money,
    pub distance_fare: Money,
    pub time_fare: Money,
    pub surge_fare: Money,
    pub booking_fee: Money,
    pub discount: Money,
}

impl FareBreakdown {
    pub fn new(base_fare: Money) -> Self {
        Self {
            base_fare,
            ..Default::default()
        }
    }

    pub fn with_distance_fare(mut self, amount: Money) -> Self {
        self.distance_fare = amount;
        self
    }

    pub fn with_time_fare(mut self, amount: Money) -> Self {
        self.time_fare = amount;
        self
    }

    pub fn with_surge_fare(mut self, amount: Money) -> Self {
        self.surge_fare = amount;
        self
    }

    pub fn with_booking_fee(mut self, amount: Money) -> Self {
        self.booking_fee = amount;
        self
    }

    pub fn with_discount(mut self, amount: Money) -> Self {
        self.discount = amount;
        self
    }

    /// What the rider owes. A discount larger than the fare makes the ride free, never negative.
    pub fn total(&self) -> Result<Money, AmountOverflowError> {
        let gross = [
            self.distance_fare,
            self.time_fare,
            self.surge_fare,
            self.booking_fee,
        ]
        .into_iter()
        .try_fold(self.base_fare, Money::checked_add)
        .ok_or(AmountOverflowError)?;
        let net = gross.checked_sub(self.discount).ok_or(AmountOverflowError)?;
        Ok(net.max(0))
    }
}

/// How a fare is split between the driver and the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub rider_pay: Money,
    pub driver_payout: Money,
    pub commission: Money,
}

impl SettlementResult {
    /// rider_pay == driver_payout + commission, with no negative leg.
    pub fn is_conserved(&self) -> bool {
        self.rider_pay >= 0
            && self.driver_payout >= 0
            && self.commission >= 0
            && self.driver_payout.checked_add(self.commission) == Some(self.rider_pay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fare_total() {
        let fare = FareBreakdown::new(20000)
            .with_distance_fare(90000)
            .with_time_fare(25000)
            .with_booking_fee(5000)
            .with_surge_fare(15000)
            .with_discount(5000);
        assert_eq!(fare.total(), Ok(150000));
    }

    #[test]
    fn test_fare_total_never_negative() {
        let fare = FareBreakdown::new(10000).with_discount(50000);
        assert_eq!(fare.total(), Ok(0));
    }

    #[test]
    fn test_fare_total_overflow() {
        let fare = FareBreakdown::new(Money::MAX).with_booking_fee(1);
        assert_eq!(fare.total(), Err(AmountOverflowError));

        let fare = FareBreakdown::new(0).with_discount(Money::MIN);
        assert_eq!(fare.total(), Err(AmountOverflowError));
    }

    #[test]
    fn test_settlement_conservation() {
        let ok = SettlementResult {
            rider_pay: 150000,
            driver_payout: 120000,
            commission: 30000,
        };
        assert!(ok.is_conserved());

        let leaky = SettlementResult {
            rider_pay: 150000,
            driver_payout: 120000,
            commission: 20000,
        };
        assert!(!leaky.is_conserved());

        let negative = SettlementResult {
            rider_pay: 100,
            driver_payout: 200,
            commission: -100,
        };
        assert!(!negative.is_conserved());

        let wrapping = SettlementResult {
            rider_pay: 0,
            driver_payout: Money::MAX,
            commission: Money::MAX,
        };
        assert!(!wrapping.is_conserved());
    }
}
