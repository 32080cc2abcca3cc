use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{BillingError, Result};
use crate::models::prestation::{Billing, BillingInput, DurationUnit};

pub const MINUTES_PER_HOUR: i64 = 60;
pub const MINUTES_PER_DAY: i64 = 1440;

/// Normalized result of a billing form.
#[derive(Debug, Clone, PartialEq)]
pub struct Computed {
    pub billing: Billing,
    /// Canonical duration in minutes
    pub duration: i64,
    /// Line amount before rounding
    pub raw_total: Decimal,
}

/// Rounds a monetary value to cents, half away from zero.
pub fn round_currency(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn non_negative(field: &'static str, value: Option<Decimal>) -> Result<Decimal> {
    let value = value.unwrap_or(Decimal::ZERO);
    if value.is_sign_negative() && !value.is_zero() {
        return Err(BillingError::validation(field, "must not be negative"));
    }
    Ok(value)
}

fn whole(field: &'static str, value: Decimal) -> Result<i64> {
    value
        .floor()
        .to_i64()
        .ok_or_else(|| BillingError::validation(field, "value out of range"))
}

/// `floor(hours) * 60 + floor(minutes)`, minutes clamped to 0..=59.
pub fn minutes_from_hours(hours: Option<Decimal>, minutes: Option<Decimal>) -> Result<i64> {
    let hours = whole("hours", non_negative("hours", hours)?)?;
    let minutes = whole("minutes", minutes.unwrap_or(Decimal::ZERO))?.clamp(0, 59);

    hours
        .checked_mul(MINUTES_PER_HOUR)
        .and_then(|m| m.checked_add(minutes))
        .ok_or_else(|| BillingError::validation("hours", "value out of range"))
}

/// Converts `(unit, value1, value2)` form input into minutes.
///
/// Days only accept a half day (`0.5`) or a full day (`1`).
pub fn minutes_for_unit(
    unit: DurationUnit,
    value1: Option<Decimal>,
    value2: Option<Decimal>,
) -> Result<i64> {
    match unit {
        DurationUnit::Hours => minutes_from_hours(value1, value2),
        DurationUnit::Minutes => whole("value1", non_negative("value1", value1)?),
        DurationUnit::Days => {
            let days = value1.unwrap_or(Decimal::ZERO);
            if days == Decimal::new(5, 1) {
                Ok(MINUTES_PER_DAY / 2)
            } else if days == Decimal::ONE {
                Ok(MINUTES_PER_DAY)
            } else {
                Err(BillingError::validation(
                    "value1",
                    format!("{} is not a half day or a full day", days),
                ))
            }
        }
    }
}

fn out_of_range() -> BillingError {
    BillingError::validation("total", "amount out of range")
}

/// Unrounded line amount for the given terms and duration.
pub fn amount(billing: &Billing, duration: i64) -> Result<Decimal> {
    let total = match billing {
        Billing::Hourly { hourly_rate } => Decimal::from(duration)
            .checked_mul(*hourly_rate)
            .and_then(|v| v.checked_div(Decimal::from(MINUTES_PER_HOUR))),
        Billing::Fixed {
            fixed_price,
            quantity,
            ..
        } => fixed_price.checked_mul(Decimal::from(*quantity)),
    };
    total.ok_or_else(out_of_range)
}

/// Adds monetary values, rejecting a sum that does not fit a `Decimal`.
pub fn checked_sum(values: impl IntoIterator<Item = Decimal>) -> Result<Decimal> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, value| acc.checked_add(value).ok_or_else(out_of_range))
}

/// Multiplies a monetary value, rejecting an overflowing result.
pub fn checked_product(value: Decimal, factor: Decimal) -> Result<Decimal> {
    value.checked_mul(factor).ok_or_else(out_of_range)
}

/// Normalizes raw form input: duration, quantity rules and line amount.
pub fn compute(input: &BillingInput) -> Result<Computed> {
    let (billing, duration) = match input {
        BillingInput::Hourly {
            hours,
            minutes,
            hourly_rate,
        } => {
            let duration = minutes_from_hours(*hours, *minutes)?;
            let hourly_rate = non_negative("hourlyRate", *hourly_rate)?;
            (Billing::Hourly { hourly_rate }, duration)
        }
        BillingInput::Fixed {
            fixed_price,
            quantity,
            duration_unit,
            value1,
            value2,
        } => {
            let duration = minutes_for_unit(*duration_unit, *value1, *value2)?;
            let fixed_price = non_negative("fixedPrice", *fixed_price)?;
            let quantity = match (duration_unit, quantity) {
                (DurationUnit::Days, _) => 1,
                (_, None) => 1,
                (_, Some(0)) => {
                    return Err(BillingError::validation(
                        "quantity",
                        "quantity must be a positive integer",
                    ))
                }
                (_, Some(q)) => *q,
            };
            (
                Billing::Fixed {
                    fixed_price,
                    quantity,
                    duration_unit: *duration_unit,
                },
                duration,
            )
        }
    };

    let raw_total = amount(&billing, duration)?;
    Ok(Computed {
        billing,
        duration,
        raw_total,
    })
}
