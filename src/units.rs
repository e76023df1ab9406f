//! Physical quantities as they appear in configuration files and instrument replies

use std::{fmt, str::FromStr};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Dimension {
    Frequency,
    Time,
    Power,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dimension::Frequency => "frequency",
            Dimension::Time => "time",
            Dimension::Power => "power",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
#[serde(try_from = "String")]
pub enum Unit {
    Hz,
    KHz,
    MHz,
    GHz,
    Ns,
    Us,
    Ms,
    S,
    Min,
    H,
    DBm,
}

impl Unit {
    pub fn dimension(self) -> Dimension {
        match self {
            Unit::Hz | Unit::KHz | Unit::MHz | Unit::GHz => Dimension::Frequency,
            Unit::Ns | Unit::Us | Unit::Ms | Unit::S | Unit::Min | Unit::H => Dimension::Time,
            Unit::DBm => Dimension::Power,
        }
    }

    /// Multiplier to the base unit of the dimension (Hz, s, dBm)
    fn scale(self) -> f64 {
        match self {
            Unit::Hz => 1.0,
            Unit::KHz => 1e3,
            Unit::MHz => 1e6,
            Unit::GHz => 1e9,
            Unit::Ns => 1e-9,
            Unit::Us => 1e-6,
            Unit::Ms => 1e-3,
            Unit::S => 1.0,
            Unit::Min => 60.0,
            Unit::H => 3600.0,
            Unit::DBm => 1.0,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Unit::Hz => "Hz",
            Unit::KHz => "kHz",
            Unit::MHz => "MHz",
            Unit::GHz => "GHz",
            Unit::Ns => "ns",
            Unit::Us => "us",
            Unit::Ms => "ms",
            Unit::S => "s",
            Unit::Min => "min",
            Unit::H => "h",
            Unit::DBm => "dBm",
        };
        f.write_str(symbol)
    }
}

impl FromStr for Unit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let unit = match s.trim() {
            "Hz" | "hz" | "HZ" => Unit::Hz,
            "kHz" | "khz" | "KHz" | "KHZ" => Unit::KHz,
            "MHz" | "mhz" | "MHZ" => Unit::MHz,
            "GHz" | "ghz" | "GHZ" => Unit::GHz,
            "ns" => Unit::Ns,
            "us" | "µs" => Unit::Us,
            "ms" => Unit::Ms,
            "s" | "sec" => Unit::S,
            "min" => Unit::Min,
            "h" | "hour" => Unit::H,
            "dBm" | "dBmW" | "dB(mW)" | "DBM" => Unit::DBm,
            other => return Err(Error::UnknownUnit(other.to_owned())),
        };
        Ok(unit)
    }
}

impl TryFrom<String> for Unit {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// A value tagged with the unit it was given in
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Quantity {
    pub value: f64,
    pub unit: Unit,
}

impl Quantity {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn hz(value: f64) -> Self {
        Self::new(value, Unit::Hz)
    }

    pub fn seconds(value: f64) -> Self {
        Self::new(value, Unit::S)
    }

    pub fn dbm(value: f64) -> Self {
        Self::new(value, Unit::DBm)
    }

    /// Value in the base unit of `expected`, or `UnitMismatch`
    pub fn base_value(&self, expected: Dimension) -> Result<f64> {
        if self.unit.dimension() != expected {
            return Err(Error::UnitMismatch {
                expected,
                found: self.unit,
            });
        }
        Ok(self.value * self.unit.scale())
    }

    pub fn to_hz(&self) -> Result<f64> {
        self.base_value(Dimension::Frequency)
    }

    pub fn to_seconds(&self) -> Result<f64> {
        self.base_value(Dimension::Time)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}
