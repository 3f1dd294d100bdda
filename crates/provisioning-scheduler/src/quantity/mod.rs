//! Parsing and arithmetic for Kubernetes resource quantities ('100m', '2Gi', '1.5e3', ...).
//!
//! [`Quantity`] stores a plain `f64` magnitude rather than the suffix-preserving
//! representation a wire-compatible type would use: this crate only ever adds,
//! subtracts, and compares quantities while packing pods onto candidate nodes, so a
//! single internal unit (no suffix bookkeeping) is both simpler and exact enough for
//! that purpose. Parsing and formatting still follow the suffix grammar below.

use std::{fmt, ops::Deref, str::FromStr};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use snafu::{OptionExt, ResultExt, Snafu};

mod suffix;
pub use suffix::Suffix;

#[derive(Debug, Snafu, PartialEq)]
pub enum ParseQuantityError {
    #[snafu(display("input is empty or contains non-ascii characters"))]
    InvalidFormat,

    #[snafu(display("failed to parse numeric part {value:?}"))]
    InvalidNumber {
        value: String,
        source: std::num::ParseFloatError,
    },

    #[snafu(display("unrecognized suffix {suffix:?}"))]
    InvalidSuffix { suffix: String },
}

/// A parsed Kubernetes quantity, stored as a plain base-unit magnitude.
///
/// ```plain
/// quantity        ::= <signedNumber><suffix>
/// suffix          ::= <binaryMultiple> | <decimalMultiple> | <decimalExponent>
/// binaryMultiple  ::= Ki | Mi | Gi | Ti | Pi | Ei
/// decimalMultiple ::= n | u | m | "" | k | M | G | T | P | E
/// decimalExponent ::= ("e" | "E") <signedNumber>
/// ```
///
/// See the upstream [serialization format][k8s-quantity].
///
/// [k8s-quantity]: https://github.com/kubernetes/apimachinery/blob/master/pkg/api/resource/quantity.go
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
pub struct Quantity(f64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0.0);

    pub fn as_f64(self) -> f64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }

    /// Saturating subtraction: never returns a negative quantity, matching the
    /// "clamped to >= 0" rule used for node-available-resource accounting.
    pub fn saturating_sub(self, rhs: Quantity) -> Quantity {
        Quantity((self.0 - rhs.0).max(0.0))
    }
}

impl Deref for Quantity {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<f64> for Quantity {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Quantity {
    type Err = ParseQuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        snafu::ensure!(!input.is_empty() && input.is_ascii(), InvalidFormatSnafu);

        if input == "0" {
            return Ok(Quantity(0.0));
        }

        let suffix_index = input
            .find(|c: char| c != '.' && c != '-' && c != '+' && !c.is_ascii_digit())
            .unwrap_or(input.len());
        let (number, suffix) = input.split_at(suffix_index);

        let value = f64::from_str(number).with_context(|_| InvalidNumberSnafu {
            value: number.to_string(),
        })?;
        let factor = Suffix::from_str(suffix)
            .with_context(|_| InvalidSuffixSnafu {
                suffix: suffix.to_string(),
            })?
            .factor();

        Ok(Quantity(value * factor))
    }
}

impl TryFrom<&K8sQuantity> for Quantity {
    type Error = ParseQuantityError;

    fn try_from(value: &K8sQuantity) -> Result<Self, Self::Error> {
        Quantity::from_str(&value.0)
    }
}

impl std::ops::Add for Quantity {
    type Output = Quantity;

    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for Quantity {
    type Output = Quantity;

    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 - rhs.0)
    }
}
