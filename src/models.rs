use std::fmt;
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::dispatch::Value;

/// Charging modes reported by `chmode`
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ChargingMode {
    Smart = 0,
    Ghost = 1,
    Safe = 2,
}

impl FromStr for ChargingMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SMART" => Ok(ChargingMode::Smart),
            "GHOST" => Ok(ChargingMode::Ghost),
            "SAFE" => Ok(ChargingMode::Safe),
            _ => Err(()),
        }
    }
}

/// SW_PSUA / SW_PSUB switch states
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PsuSw {
    Off = 0,
    AOn = 1,
    BOn = 2,
}

impl FromStr for PsuSw {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OFF" => Ok(PsuSw::Off),
            "A_ON" => Ok(PsuSw::AOn),
            "B_ON" => Ok(PsuSw::BOn),
            _ => Err(()),
        }
    }
}

/// Reply of `measure`
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementData {
    pub vbus_a: f64,
    pub vbus_b: f64,
    pub current: f64,
    pub vcc1_a: f64,
    pub vcc2_a: f64,
    pub vcc1_b: f64,
    pub vcc2_b: f64,
    pub temperature: f64,
    pub charge_mode: i64,
    pub py_msg: i64,
}

impl MeasurementData {
    pub const FIELDS: usize = 10;

    pub fn from_values(values: &[Value]) -> Option<Self> {
        let [vbus_a, vbus_b, current, vcc1_a, vcc2_a, vcc1_b, vcc2_b, temperature, charge_mode, py_msg] = values else {
            return None;
        };
        Some(MeasurementData {
            vbus_a: vbus_a.as_f64()?,
            vbus_b: vbus_b.as_f64()?,
            current: current.as_f64()?,
            vcc1_a: vcc1_a.as_f64()?,
            vcc2_a: vcc2_a.as_f64()?,
            vcc1_b: vcc1_b.as_f64()?,
            vcc2_b: vcc2_b.as_f64()?,
            temperature: temperature.as_f64()?,
            charge_mode: charge_mode.as_i64()?,
            py_msg: py_msg.as_i64()?,
        })
    }
}

/// Reply of `button`: pushes since last read, short and long push status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonData {
    pub push_count: i64,
    pub short_push_status: i64,
    pub long_push_status: i64,
}

impl ButtonData {
    pub const FIELDS: usize = 3;

    pub fn from_values(values: &[Value]) -> Option<Self> {
        let [push_count, short_push_status, long_push_status] = values else {
            return None;
        };
        Some(ButtonData {
            push_count: push_count.as_i64()?,
            short_push_status: short_push_status.as_i64()?,
            long_push_status: long_push_status.as_i64()?,
        })
    }
}

/// Snapshot of the informational commands, gathered on demand
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub serial: Option<String>,
    pub mac: Option<String>,
    pub version: Option<String>,
    pub sw_version: Option<String>,
    pub hw_version: Option<f64>,
    pub status: Option<String>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field<T: fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map_or_else(|| "-".to_string(), T::to_string)
        }
        writeln!(f, "serial:     {}", field(&self.serial))?;
        writeln!(f, "mac:        {}", field(&self.mac))?;
        writeln!(f, "version:    {}", field(&self.version))?;
        writeln!(f, "swversion:  {}", field(&self.sw_version))?;
        writeln!(f, "hwversion:  {}", field(&self.hw_version))?;
        write!(f, "status:     {}", field(&self.status))
    }
}
