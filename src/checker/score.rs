//! Fixed-point percentage scores
//!
//! Scores are kept as an integer count of ten-thousandths of a percent and
//! parsed straight from checker output without passing through floating
//! point, so summing many test scores never drifts.

use std::fmt;
use std::iter::Sum;
use std::ops::Add;

/// Fractional digits of a percent that are kept
const FRACTION_DIGITS: u32 = 4;
const SCALE: i64 = 10i64.pow(FRACTION_DIGITS);

/// A score in ten-thousandths of a percent.
///
/// Values built by the constructors and parsers are clamped to [0, 100].
/// Sums are not: adding scores saturates at the `i64` range, so the total of
/// several tests can exceed `HUNDRED`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Percentage(i64);

impl Percentage {
    pub const ZERO: Percentage = Percentage(0);
    pub const HUNDRED: Percentage = Percentage(100 * SCALE);

    pub fn from_percent(percent: i64) -> Self {
        Percentage(percent.saturating_mul(SCALE)).clamped()
    }

    /// Parse a decimal percent such as `"50"` or `"33.3333"`
    pub fn parse_percent(text: &str) -> Option<Self> {
        parse_scaled(text, FRACTION_DIGITS).map(|units| Percentage(units).clamped())
    }

    /// Parse a decimal ratio in [0, 1] such as `"0.5"` and scale it by 100
    pub fn parse_ratio(text: &str) -> Option<Self> {
        parse_scaled(text, FRACTION_DIGITS + 2).map(|units| Percentage(units).clamped())
    }

    /// Ten-thousandths of a percent
    pub fn units(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    fn clamped(self) -> Self {
        Percentage(self.0.clamp(0, Self::HUNDRED.0))
    }
}

/// Parse an optionally signed decimal, keeping `digits` fractional digits
/// (rounded half up). Saturates instead of overflowing.
fn parse_scaled(text: &str, digits: u32) -> Option<i64> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }

    let push = |units: i64, digit: u8| units.saturating_mul(10).saturating_add((digit - b'0') as i64);

    let mut units = int_part.bytes().fold(0i64, push);
    let mut fraction = frac_part.bytes();
    for _ in 0..digits {
        units = push(units, fraction.next().unwrap_or(b'0'));
    }
    if fraction.next().map_or(false, |d| d >= b'5') {
        units = units.saturating_add(1);
    }

    Some(if negative { -units } else { units })
}

/// Unclamped; aggregates may go past 100
impl Add for Percentage {
    type Output = Percentage;

    fn add(self, rhs: Percentage) -> Percentage {
        Percentage(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Percentage {
    fn sum<I: Iterator<Item = Percentage>>(iter: I) -> Percentage {
        iter.fold(Percentage::ZERO, Add::add)
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / SCALE as u64;
        let frac = abs % SCALE as u64;
        if frac == 0 {
            return write!(f, "{}{}", sign, whole);
        }
        let frac = format!("{:0width$}", frac, width = FRACTION_DIGITS as usize);
        write!(f, "{}{}.{}", sign, whole, frac.trim_end_matches('0'))
    }
}
