//! Fixed-point quantities.

use rust_decimal::Decimal;

/// Fractional digits kept for quantities and money.
pub const SCALE: u32 = 6;

/// Round to the storage scale.
pub fn normalize(value: Decimal) -> Decimal {
    value.round_dp(SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn rounds_to_six_places() {
        let v = Decimal::from_str("1.23456789").unwrap();
        assert_eq!(normalize(v), Decimal::from_str("1.234568").unwrap());
    }
}
