use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ScriptBindError;

/// Stable integer handle naming an entity in the host simulation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ObjectId(pub i32);

impl ObjectId {
    pub const NONE: ObjectId = ObjectId(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(out, "{}", self.0)
    }
}

/// Simulation time in milliseconds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Time(pub u64);

impl Time {
    pub const ZERO: Time = Time(0);

    pub fn seconds(seconds: u64) -> Self {
        Time(seconds * 1000)
    }

    pub fn minutes(minutes: u64) -> Self {
        Time(minutes * 60_000)
    }

    pub fn millis(self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, rhs: Time) -> Time {
        Time(self.0.saturating_sub(rhs.0))
    }
}

impl Add for Time {
    type Output = Time;

    fn add(self, rhs: Time) -> Time {
        Time(self.0 + rhs.0)
    }
}

impl Sub for Time {
    type Output = Time;

    fn sub(self, rhs: Time) -> Time {
        Time(self.0 - rhs.0)
    }
}

fn time_code_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([0-9]*\.?[0-9]+)\s*([mMsS]?)\s*$").expect("time code regex should compile")
    })
}

impl FromStr for Time {
    type Err = ScriptBindError;

    /// Decodes `"750"` (milliseconds), `"1.5s"` and `"2m"` codes.
    fn from_str(code: &str) -> Result<Self, Self::Err> {
        let captures = time_code_regex().captures(code).ok_or_else(|| {
            ScriptBindError::new("TIME_CODE", format!("Invalid time code \"{}\".", code))
        })?;
        let units: f64 = captures[1].parse().map_err(|_| {
            ScriptBindError::new("TIME_CODE", format!("Invalid time code \"{}\".", code))
        })?;
        let scale = match &captures[2] {
            "m" | "M" => 60_000.0,
            "s" | "S" => 1000.0,
            _ => 1.0,
        };
        Ok(Time((units * scale) as u64))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(out, "{}", self.0)
    }
}

/// Labeled axis of a 3-vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    X,
    Y,
    Z,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector {
    pub const EPSILON: f64 = 0.00001;

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f64 {
        f64::from(self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn mag_squared(&self) -> f64 {
        f64::from(self.x * self.x + self.y * self.y + self.z * self.z)
    }

    pub fn dot(&self, rhs: &Vector) -> f64 {
        f64::from(self.x * rhs.x + self.y * rhs.y + self.z * rhs.z)
    }

    pub fn cross(&self, rhs: &Vector) -> Vector {
        Vector::new(
            self.y * rhs.z - self.z * rhs.y,
            self.z * rhs.x - self.x * rhs.z,
            self.x * rhs.y - self.y * rhs.x,
        )
    }

    pub fn normal(&self) -> Vector {
        let scale = (self.magnitude() + Self::EPSILON) as f32;
        Vector::new(self.x / scale, self.y / scale, self.z / scale)
    }

    pub fn distance(&self, from: &Vector) -> f64 {
        Vector::new(from.x - self.x, from.y - self.y, from.z - self.z).magnitude()
    }

    pub fn component(&self, component: Component) -> f32 {
        match component {
            Component::X => self.x,
            Component::Y => self.y,
            Component::Z => self.z,
        }
    }

    pub fn set_component(&mut self, component: Component, value: f32) {
        match component {
            Component::X => self.x = value,
            Component::Y => self.y = value,
            Component::Z => self.z = value,
        }
    }
}

impl FromStr for Vector {
    type Err = ScriptBindError;

    /// Decodes a comma-separated triple such as `"1,2.5,-3"`.
    fn from_str(code: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ScriptBindError::new(
                "VECTOR_CODE",
                format!("Invalid vector specification \"{}\".", code),
            )
        };
        let first = code.find(',').ok_or_else(invalid)?;
        let last = code.rfind(',').ok_or_else(invalid)?;
        if first == last {
            return Err(invalid());
        }
        let x = code[..first].trim().parse().map_err(|_| invalid())?;
        let y = code[first + 1..last].trim().parse().map_err(|_| invalid())?;
        let z = code[last + 1..].trim().parse().map_err(|_| invalid())?;
        Ok(Vector::new(x, y, z))
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(out, "({:.3},{:.3},{:.3})", self.x, self.y, self.z)
    }
}

/// Interpolation curve shapes for timed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Curve {
    #[default]
    Linear,
    Quadratic,
    Radical,
    Log10,
    Pow10,
    LogE,
    PowE,
}

impl Curve {
    pub fn apply(self, alpha: f64) -> f64 {
        const INV_E: f64 = 0.367_879_441_171_442_33;
        const ONE_MINUS_INV_E: f64 = 0.632_120_558_828_557_7;
        const INV_E_MINUS_ONE: f64 = 0.581_976_706_869_326_4;

        let alpha = alpha.clamp(0.0, 1.0);
        match self {
            Curve::Linear => alpha,
            Curve::Quadratic => alpha * alpha,
            Curve::Radical => alpha.sqrt(),
            Curve::Log10 => 1.0 + (alpha * 0.9 + 0.1).log10(),
            Curve::Pow10 => (10.0_f64.powf(alpha) - 1.0) / 9.0,
            Curve::LogE => 1.0 + (alpha * ONE_MINUS_INV_E + INV_E).ln(),
            Curve::PowE => INV_E_MINUS_ONE * (alpha.exp() - 1.0),
        }
    }
}

impl Curve {
    pub fn code(self) -> &'static str {
        match self {
            Curve::Linear => "linear",
            Curve::Quadratic => "quadratic",
            Curve::Radical => "radical",
            Curve::Log10 => "log_10",
            Curve::Pow10 => "pow_10",
            Curve::LogE => "log_e",
            Curve::PowE => "pow_e",
        }
    }
}

impl FromStr for Curve {
    type Err = ScriptBindError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code.to_ascii_lowercase().as_str() {
            "linear" => Ok(Curve::Linear),
            "quadratic" | "square" => Ok(Curve::Quadratic),
            "radical" | "sqrt" => Ok(Curve::Radical),
            "log_10" | "log-10" | "log" => Ok(Curve::Log10),
            "pow_10" | "pow-10" | "10^" => Ok(Curve::Pow10),
            "log_e" | "log-e" | "ln" => Ok(Curve::LogE),
            "pow_e" | "pow-e" | "e^" => Ok(Curve::PowE),
            _ => Err(ScriptBindError::new(
                "ENUM_CODE",
                format!("Invalid curve code \"{}\".", code),
            )),
        }
    }
}

#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn time_codes_decode_with_unit_suffixes() {
        assert_eq!("750".parse::<Time>().expect("millis"), Time(750));
        assert_eq!("1.5s".parse::<Time>().expect("seconds"), Time(1500));
        assert_eq!("2m".parse::<Time>().expect("minutes"), Time(120_000));
        assert_eq!(" 3 S ".parse::<Time>().expect("spaced"), Time(3000));
    }

    #[test]
    fn time_codes_reject_unknown_suffixes() {
        let error = "5q".parse::<Time>().expect_err("bad suffix should fail");
        assert_eq!(error.code, "TIME_CODE");
        let error = "fast".parse::<Time>().expect_err("no number should fail");
        assert_eq!(error.code, "TIME_CODE");
    }

    #[test]
    fn vector_codes_decode_comma_triples() {
        let vector = "1,2.5,-3".parse::<Vector>().expect("triple");
        assert_eq!(vector, Vector::new(1.0, 2.5, -3.0));

        let error = "1,2".parse::<Vector>().expect_err("pair should fail");
        assert_eq!(error.code, "VECTOR_CODE");
    }

    #[test]
    fn vector_component_access_reads_and_writes_one_axis() {
        let mut vector = Vector::new(1.0, 2.0, 3.0);
        assert_eq!(vector.component(Component::Y), 2.0);
        vector.set_component(Component::Z, 9.0);
        assert_eq!(vector, Vector::new(1.0, 2.0, 9.0));
    }

    #[test]
    fn curve_endpoints_are_fixed() {
        for curve in [
            Curve::Linear,
            Curve::Quadratic,
            Curve::Radical,
            Curve::Log10,
            Curve::Pow10,
            Curve::LogE,
            Curve::PowE,
        ] {
            assert!(curve.apply(0.0).abs() < 1e-9, "{:?} at zero", curve);
            assert!((curve.apply(1.0) - 1.0).abs() < 1e-9, "{:?} at one", curve);
        }
    }

    #[test]
    fn curve_codes_accept_aliases() {
        assert_eq!("sqrt".parse::<Curve>().expect("alias"), Curve::Radical);
        assert_eq!("10^".parse::<Curve>().expect("alias"), Curve::Pow10);
        let error = "bezier".parse::<Curve>().expect_err("unknown should fail");
        assert_eq!(error.code, "ENUM_CODE");
    }
}
