// Copyright 2026 Joyent, Inc.

use bytes::Bytes;
use rand::Rng;

use crate::constants::CMD_GET_REG;
use crate::error::{PackError, PacketError};
use crate::pack::{PackFormat, Value};
use crate::packet::Packet;

/// Inclusive bounds of one numeric register field. Values outside are
/// saturated, never rejected.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FieldBounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl FieldBounds {
    pub fn new(min: f64, max: f64) -> FieldBounds {
        FieldBounds {
            min: Some(min),
            max: Some(max),
        }
    }

    fn clamp(&self, mut v: f64) -> f64 {
        if let Some(min) = self.min {
            v = v.max(min);
        }
        if let Some(max) = self.max {
            v = v.min(max);
        }
        v
    }
}

/// Host side state of one register: the packed bytes last set, plus
/// everything needed to answer a get and to validate a set.
#[derive(Clone, Debug)]
pub struct RegisterServer {
    code: u16,
    fmt: String,
    format: PackFormat,
    data: Option<Bytes>,
    reset_data: Option<Bytes>,
    bounds: Vec<FieldBounds>,
    read_only: bool,
    error: Option<f64>,
    pub last_set_time: Option<u64>,
}

impl RegisterServer {
    /// A register without a default has no data and does not answer gets
    /// until a value is set.
    pub fn new(code: u16, fmt: &str, default: Option<&[Value]>) -> Result<RegisterServer, PackError> {
        let format: PackFormat = fmt.parse()?;
        let data = match default {
            Some(values) => Some(Bytes::from(format.pack(values)?)),
            None => None,
        };
        Ok(RegisterServer {
            code,
            fmt: String::from(fmt),
            format,
            reset_data: data.clone(),
            data,
            bounds: Vec::new(),
            read_only: false,
            error: None,
            last_set_time: None,
        })
    }

    /// Declare bounds for field `field`.
    pub fn with_bounds(mut self, field: usize, bounds: FieldBounds) -> RegisterServer {
        if self.bounds.len() <= field {
            self.bounds.resize(field + 1, FieldBounds::default());
        }
        self.bounds[field] = bounds;
        self
    }

    /// Reports of this register get up to `amplitude` of random noise added
    /// to every numeric field.
    pub fn with_error(mut self, amplitude: f64) -> RegisterServer {
        self.error = Some(amplitude);
        self
    }

    pub fn read_only(mut self) -> RegisterServer {
        self.read_only = true;
        self
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn pack_format(&self) -> &str {
        &self.fmt
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Registers `0x100-0x1ff` are constants as far as the bus is concerned.
    pub fn is_const(&self) -> bool {
        self.code >> 8 == 0x1
    }

    pub fn set_error(&mut self, amplitude: Option<f64>) {
        self.error = amplitude;
    }

    pub fn values(&self) -> Result<Vec<Value>, PackError> {
        match &self.data {
            Some(d) => self.format.unpack(d),
            None => Ok(Vec::new()),
        }
    }

    fn normalize(&self, values: &mut [Value]) {
        for (v, b) in values.iter_mut().zip(self.bounds.iter()) {
            if let Value::Num(n) = v {
                *n = b.clamp(*n);
            }
        }
    }

    /// Store `values` as the new register data. Returns whether a change
    /// should be signalled: the stored bytes differ and `skip_change` is
    /// not set.
    pub fn set_values(&mut self, values: &[Value], skip_change: bool) -> Result<bool, PackError> {
        if self.read_only {
            return Ok(false);
        }
        let mut values = values.to_vec();
        self.normalize(&mut values);
        let d = self.format.pack(&values)?;
        Ok(self.store(d) && !skip_change)
    }

    fn store(&mut self, d: Vec<u8>) -> bool {
        if self.data.as_deref() == Some(&d[..]) {
            return false;
        }
        self.data = Some(Bytes::from(d));
        true
    }

    /// Apply a set-register payload received from the bus: unpack, clamp
    /// each field and repack. Returns whether the stored bytes changed.
    pub fn apply_set(&mut self, payload: &[u8], now: u64) -> Result<bool, PackError> {
        if self.is_const() {
            return Ok(false);
        }
        let mut values = self.format.unpack(payload)?;
        self.normalize(&mut values);
        let d = self.format.pack(&values)?;
        self.last_set_time = Some(now);
        Ok(self.store(d))
    }

    pub fn reset(&mut self) {
        self.data = self.reset_data.clone();
    }

    /// The report answering a get, `None` while the register has no data.
    pub fn get_report(&self) -> Result<Option<Packet>, PacketError> {
        let data = match &self.data {
            Some(d) => d,
            None => return Ok(None),
        };
        let cmd = CMD_GET_REG | self.code;
        if let Some(amplitude) = self.error.filter(|e| *e != 0.0 && !e.is_nan()) {
            if let Ok(mut values) = self.format.unpack(data) {
                let mut rng = rand::thread_rng();
                for v in values.iter_mut() {
                    if let Value::Num(n) = v {
                        *n += rng.gen::<f64>() * amplitude;
                    }
                }
                if let Ok(noisy) = self.format.pack(&values) {
                    return Packet::from_cmd(cmd, &noisy).map(Some);
                }
            }
        }
        Packet::from_cmd(cmd, data).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intensity() -> RegisterServer {
        RegisterServer::new(0x01, "u8", Some(&[Value::from(10u32)]))
            .unwrap()
            .with_bounds(0, FieldBounds::new(0.0, 100.0))
    }

    #[test]
    fn set_clamps_to_bounds() {
        let mut reg = intensity();
        assert!(reg.apply_set(&[200], 5).unwrap());
        assert_eq!(reg.data(), Some(&[100u8][..]));
        assert_eq!(reg.last_set_time, Some(5));
        // clamps to the value already stored: no change
        assert!(!reg.apply_set(&[150], 6).unwrap());
        assert_eq!(reg.data(), Some(&[100u8][..]));
    }

    #[test]
    fn host_set_clamps_and_skips_change() {
        let mut reg = intensity();
        assert!(reg.set_values(&[Value::Num(-4.0)], false).unwrap());
        assert_eq!(reg.values().unwrap(), vec![Value::Num(0.0)]);
        assert!(!reg.set_values(&[Value::Num(5.0)], true).unwrap());
        assert_eq!(reg.values().unwrap(), vec![Value::Num(5.0)]);
    }

    #[test]
    fn const_registers_ignore_bus_sets() {
        let mut reg = RegisterServer::new(0x180, "s", Some(&[Value::from("x")])).unwrap();
        assert!(reg.is_const());
        assert!(!reg.apply_set(b"y", 0).unwrap());
        assert_eq!(reg.data(), Some(&b"x"[..]));
    }

    #[test]
    fn read_only_ignores_host_sets() {
        let mut reg = intensity().read_only();
        assert!(!reg.set_values(&[Value::Num(1.0)], false).unwrap());
        assert_eq!(reg.data(), Some(&[10u8][..]));
    }

    #[test]
    fn malformed_set_is_rejected() {
        let mut reg = RegisterServer::new(0x02, "u16 u16", Some(&[0u32.into(), 0u32.into()])).unwrap();
        assert!(reg.apply_set(&[1], 0).is_err());
        assert_eq!(reg.data(), Some(&[0u8, 0, 0, 0][..]));
    }

    #[test]
    fn reset_restores_default() {
        let mut reg = intensity();
        reg.apply_set(&[50], 0).unwrap();
        reg.reset();
        assert_eq!(reg.data(), Some(&[10u8][..]));
    }

    #[test]
    fn get_report() {
        let reg = intensity();
        let p = reg.get_report().unwrap().unwrap();
        assert_eq!(p.service_command(), 0x1001);
        assert_eq!(p.payload(), &[10]);

        let empty = RegisterServer::new(0x186, "u64", None).unwrap();
        assert!(empty.get_report().unwrap().is_none());
    }

    #[test]
    fn error_noise_stays_within_amplitude() {
        let reg = RegisterServer::new(0x101, "u32", Some(&[1000u32.into()]))
            .unwrap()
            .with_error(10.0);
        for _ in 0..20 {
            let p = reg.get_report().unwrap().unwrap();
            let v = p.uint_data().unwrap();
            assert!((1000..=1010).contains(&v), "{}", v);
        }
    }
}
