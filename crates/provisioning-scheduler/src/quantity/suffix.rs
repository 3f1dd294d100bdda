use std::str::FromStr;

use snafu::Snafu;

#[derive(Debug, Snafu, PartialEq)]
#[snafu(display("unrecognized quantity suffix"))]
pub struct ParseSuffixError;

/// The three suffix families accepted by the Kubernetes quantity grammar, collapsed to
/// a single scaling factor relative to the unsuffixed unit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Suffix {
    /// `Ki`, `Mi`, `Gi`, `Ti`, `Pi`, `Ei` — powers of 1024.
    Binary(u32),
    /// `n`, `u`, `m`, `""`, `k`, `M`, `G`, `T`, `P`, `E` — powers of 1000.
    Decimal(i32),
    /// `e<exp>` / `E<exp>` — scientific notation.
    Exponent(f64),
}

impl Suffix {
    pub fn factor(self) -> f64 {
        match self {
            Suffix::Binary(exp) => 2f64.powi(exp as i32),
            Suffix::Decimal(exp) => 10f64.powi(exp),
            Suffix::Exponent(exp) => 10f64.powf(exp),
        }
    }
}

impl FromStr for Suffix {
    type Err = ParseSuffixError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(match input {
            "" => Suffix::Decimal(0),
            "Ki" => Suffix::Binary(10),
            "Mi" => Suffix::Binary(20),
            "Gi" => Suffix::Binary(30),
            "Ti" => Suffix::Binary(40),
            "Pi" => Suffix::Binary(50),
            "Ei" => Suffix::Binary(60),
            "n" => Suffix::Decimal(-9),
            "u" => Suffix::Decimal(-6),
            "m" => Suffix::Decimal(-3),
            "k" => Suffix::Decimal(3),
            "M" => Suffix::Decimal(6),
            "G" => Suffix::Decimal(9),
            "T" => Suffix::Decimal(12),
            "P" => Suffix::Decimal(15),
            "E" => Suffix::Decimal(18),
            other => {
                let rest = other
                    .strip_prefix('e')
                    .or_else(|| other.strip_prefix('E'))
                    .ok_or(ParseSuffixError)?;
                let exp = f64::from_str(rest).map_err(|_| ParseSuffixError)?;
                Suffix::Exponent(exp)
            }
        })
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("Ki", 1024.0)]
    #[case("Mi", 1024.0 * 1024.0)]
    #[case("", 1.0)]
    #[case("k", 1000.0)]
    #[case("m", 0.001)]
    fn known_suffix_factors(#[case] input: &str, #[case] expected: f64) {
        assert_eq!(Suffix::from_str(input).unwrap().factor(), expected);
    }

    #[test]
    fn exponent_suffix() {
        assert_eq!(Suffix::from_str("e3").unwrap().factor(), 1000.0);
        assert_eq!(Suffix::from_str("E-2").unwrap().factor(), 0.01);
    }
}
