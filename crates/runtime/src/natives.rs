//! Native functions installed into every fresh VM

use lox_core::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// `clock()`: wall-clock seconds since the Unix epoch, as a number.
pub fn clock(_args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0);
    Value::number(seconds)
}
