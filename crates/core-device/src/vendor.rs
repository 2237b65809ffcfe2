//! Vendor SDK binding, compiled only with the `vendor-dsp` feature.
//!
//! The SDK is a non-reentrant C library; every call funnels through one
//! process-wide mutex. Function signatures follow the vendor header; the
//! library returns 0 on success and a positive error code otherwise.

use crate::port::{CardError, CardPort, CardStatus};
use std::sync::Mutex;

#[link(name = "slmscan")]
unsafe extern "C" {
    fn slm_open_card() -> i32;
    fn slm_close_card();
    fn slm_load_correction(data: *const u8, len: usize) -> i32;
    fn slm_set_start_list() -> i32;
    fn slm_set_end_of_list() -> i32;
    fn slm_execute_list() -> i32;
    fn slm_stop_execution() -> i32;
    fn slm_jump_abs(x: i32, y: i32) -> i32;
    fn slm_mark_abs(x: i32, y: i32) -> i32;
    fn slm_set_laser_power(power: u16) -> i32;
    fn slm_set_laser_mode(mode: u8) -> i32;
    fn slm_set_mark_speed(bits_per_ms: f64) -> i32;
    fn slm_set_jump_speed(bits_per_ms: f64) -> i32;
    fn slm_set_wobble(amplitude_bits: u32, frequency_hz: f32) -> i32;
    fn slm_laser_disable() -> i32;
    fn slm_read_status() -> u32;
    fn slm_get_last_error() -> i32;
}

/// Real card behind the vendor SDK.
pub struct VendorCard {
    call: Mutex<()>,
}

impl VendorCard {
    pub fn new() -> Self {
        Self {
            call: Mutex::new(()),
        }
    }

    fn invoke(&self, op: &'static str, f: impl FnOnce() -> i32) -> Result<(), CardError> {
        let _serial = self.call.lock().expect("vendor call lock poisoned");
        let code = f();
        if code == 0 {
            Ok(())
        } else {
            Err(CardError::new(op, code))
        }
    }
}

impl Default for VendorCard {
    fn default() -> Self {
        Self::new()
    }
}

impl CardPort for VendorCard {
    fn open(&self) -> Result<(), CardError> {
        self.invoke("open", || unsafe { slm_open_card() })
    }

    fn close(&self) {
        let _serial = self.call.lock().expect("vendor call lock poisoned");
        unsafe { slm_close_card() }
    }

    fn load_correction(&self, table: &[u8]) -> Result<(), CardError> {
        self.invoke("load_correction", || unsafe {
            slm_load_correction(table.as_ptr(), table.len())
        })
    }

    fn set_start_list(&self) -> Result<(), CardError> {
        self.invoke("set_start_list", || unsafe { slm_set_start_list() })
    }

    fn set_end_of_list(&self) -> Result<(), CardError> {
        self.invoke("set_end_of_list", || unsafe { slm_set_end_of_list() })
    }

    fn execute_list(&self) -> Result<(), CardError> {
        self.invoke("execute_list", || unsafe { slm_execute_list() })
    }

    fn stop_execution(&self) -> Result<(), CardError> {
        self.invoke("stop_execution", || unsafe { slm_stop_execution() })
    }

    fn jump_abs(&self, x: i32, y: i32) -> Result<(), CardError> {
        self.invoke("jump_abs", || unsafe { slm_jump_abs(x, y) })
    }

    fn mark_abs(&self, x: i32, y: i32) -> Result<(), CardError> {
        self.invoke("mark_abs", || unsafe { slm_mark_abs(x, y) })
    }

    fn set_laser_power(&self, power: u16) -> Result<(), CardError> {
        self.invoke("set_laser_power", || unsafe { slm_set_laser_power(power) })
    }

    fn set_laser_mode(&self, mode: u8) -> Result<(), CardError> {
        self.invoke("set_laser_mode", || unsafe { slm_set_laser_mode(mode) })
    }

    fn set_mark_speed(&self, bits_per_ms: f64) -> Result<(), CardError> {
        self.invoke("set_mark_speed", || unsafe {
            slm_set_mark_speed(bits_per_ms)
        })
    }

    fn set_jump_speed(&self, bits_per_ms: f64) -> Result<(), CardError> {
        self.invoke("set_jump_speed", || unsafe {
            slm_set_jump_speed(bits_per_ms)
        })
    }

    fn set_wobble(&self, amplitude_bits: u32, frequency_hz: f32) -> Result<(), CardError> {
        self.invoke("set_wobble", || unsafe {
            slm_set_wobble(amplitude_bits, frequency_hz)
        })
    }

    fn laser_disable(&self) -> Result<(), CardError> {
        self.invoke("laser_disable", || unsafe { slm_laser_disable() })
    }

    fn read_status(&self) -> CardStatus {
        let _serial = self.call.lock().expect("vendor call lock poisoned");
        CardStatus::from_bits_truncate(unsafe { slm_read_status() })
    }

    fn last_error(&self) -> i32 {
        let _serial = self.call.lock().expect("vendor call lock poisoned");
        unsafe { slm_get_last_error() }
    }
}
