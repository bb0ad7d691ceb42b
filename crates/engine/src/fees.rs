//! Exchange commission calculation
//!
//! Formula: fee = notional × commission_rate
//! Charged on every buy and every sell.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Commission for a fill of `notional` quote value.
///
/// - Result rounded down to 8 decimal places
/// - Returns 0 for non-positive notionals or rates
pub fn calculate_commission(notional: Decimal, rate: Decimal) -> Decimal {
    if notional <= Decimal::ZERO || rate <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let raw_fee = notional * rate;

    // Round down to 8 decimal places
    let scale_factor = dec!(100000000);
    (raw_fee * scale_factor).floor() / scale_factor
}

/// Largest order value whose fill plus commission still fits in `cash`
pub fn max_affordable(cash: Decimal, rate: Decimal) -> Decimal {
    if cash <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let rate = rate.max(Decimal::ZERO);
    let scale_factor = dec!(100000000);
    (cash / (Decimal::ONE + rate) * scale_factor).floor() / scale_factor
}
