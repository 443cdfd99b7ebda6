//! Parsing of Kubernetes quantities into comparable values.
//!
//! Only comparisons are needed (requests vs. limits, old vs. new storage size), so quantities are
//! normalized to a plain `f64` in base units.

use std::{cmp::Ordering, num::ParseFloatError, str::FromStr};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use snafu::{ResultExt as _, Snafu, ensure};

#[derive(Debug, PartialEq, Snafu)]
pub enum ParseQuantityError {
    #[snafu(display("input {input:?} is either empty or contains non-ascii characters"))]
    InvalidFormat { input: String },

    #[snafu(display("failed to parse floating point number of {input:?}"))]
    InvalidFloat {
        source: ParseFloatError,
        input: String,
    },

    #[snafu(display("failed to parse {suffix:?} as quantity suffix"))]
    InvalidSuffix { suffix: String },
}

/// Supported byte-multiples based on powers of 2.
#[derive(Clone, Copy, Debug, PartialEq, strum::Display, strum::EnumString)]
enum BinaryMultiple {
    #[strum(serialize = "Ki")]
    Kibi,
    #[strum(serialize = "Mi")]
    Mebi,
    #[strum(serialize = "Gi")]
    Gibi,
    #[strum(serialize = "Ti")]
    Tebi,
    #[strum(serialize = "Pi")]
    Pebi,
    #[strum(serialize = "Ei")]
    Exbi,
}

impl BinaryMultiple {
    fn factor(self) -> f64 {
        match self {
            Self::Kibi => 2f64.powi(10),
            Self::Mebi => 2f64.powi(20),
            Self::Gibi => 2f64.powi(30),
            Self::Tebi => 2f64.powi(40),
            Self::Pebi => 2f64.powi(50),
            Self::Exbi => 2f64.powi(60),
        }
    }
}

/// Supported multiples based on powers of 10.
// (Note that 1024 = 1Ki but 1000 = 1k)
#[derive(Clone, Copy, Debug, PartialEq, strum::Display, strum::EnumString)]
enum DecimalMultiple {
    #[strum(serialize = "n")]
    Nano,
    #[strum(serialize = "u")]
    Micro,
    #[strum(serialize = "m")]
    Milli,
    #[strum(serialize = "k")]
    Kilo,
    #[strum(serialize = "M")]
    Mega,
    #[strum(serialize = "G")]
    Giga,
    #[strum(serialize = "T")]
    Tera,
    #[strum(serialize = "P")]
    Peta,
    #[strum(serialize = "E")]
    Exa,
}

impl DecimalMultiple {
    fn factor(self) -> f64 {
        match self {
            Self::Nano => 10f64.powi(-9),
            Self::Micro => 10f64.powi(-6),
            Self::Milli => 10f64.powi(-3),
            Self::Kilo => 10f64.powi(3),
            Self::Mega => 10f64.powi(6),
            Self::Giga => 10f64.powi(9),
            Self::Tera => 10f64.powi(12),
            Self::Peta => 10f64.powi(15),
            Self::Exa => 10f64.powi(18),
        }
    }
}

/// A quantity normalized to its base unit (bytes, cores).
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct Quantity(f64);

impl Quantity {
    pub fn value(self) -> f64 {
        self.0
    }
}

impl FromStr for Quantity {
    type Err = ParseQuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        ensure!(
            !input.is_empty() && input.is_ascii(),
            InvalidFormatSnafu { input }
        );

        let (number, suffix) = match input
            .find(|c: char| c != '.' && c != '-' && c != '+' && !c.is_ascii_digit())
        {
            Some(index) => input.split_at(index),
            None => (input, ""),
        };
        let value = f64::from_str(number).context(InvalidFloatSnafu { input })?;

        let factor = if suffix.is_empty() {
            1.0
        } else if let Ok(binary) = BinaryMultiple::from_str(suffix) {
            binary.factor()
        } else if let Ok(decimal) = DecimalMultiple::from_str(suffix) {
            decimal.factor()
        } else if let Some(exponent) = suffix.strip_prefix(['e', 'E']) {
            let exponent = f64::from_str(exponent)
                .ok()
                .ok_or_else(|| InvalidSuffixSnafu { suffix }.build())?;
            10f64.powf(exponent)
        } else {
            return InvalidSuffixSnafu { suffix }.fail();
        };

        Ok(Self(value * factor))
    }
}

impl TryFrom<&K8sQuantity> for Quantity {
    type Error = ParseQuantityError;

    fn try_from(value: &K8sQuantity) -> Result<Self, Self::Error> {
        Self::from_str(&value.0)
    }
}

/// Compares two quantity strings, e.g. `1Gi` and `1024Mi`.
pub fn compare(left: &str, right: &str) -> Result<Ordering, ParseQuantityError> {
    let left = Quantity::from_str(left)?;
    let right = Quantity::from_str(right)?;
    Ok(left.0.total_cmp(&right.0))
}
