//! Mantissa/exponent encoding of validity times.
//!
//! A byte `(a << 4) | b` represents `C * (1 + a / 16) * 2^b` seconds with `C = 1/16`.

use std::time::Duration;

/// The scaling constant, in seconds.
const C: f64 = 1.0 / 16.0;

/// Encodes a duration into its one-byte mantissa/exponent form, rounding up.
pub fn encode(duration: Duration) -> u8 {
    let ratio = duration.as_secs_f64() / C;
    if ratio <= 1.0 {
        return 0;
    }

    let mut b = ratio.log2().floor() as i32;
    if b > 15 {
        return 0xff;
    }
    b = b.max(0);

    let mut a = (16.0 * (ratio / f64::from(1u32 << b) - 1.0) - 1e-6).ceil() as i32;
    a = a.clamp(0, 16);
    if a == 16 {
        b += 1;
        a = 0;
    }
    if b > 15 {
        return 0xff;
    }

    ((a as u8) << 4) | b as u8
}

/// Decodes a one-byte mantissa/exponent value into a duration.
pub fn decode(value: u8) -> Duration {
    let a = f64::from(value >> 4);
    let b = i32::from(value & 0x0f);

    Duration::from_secs_f64(C * (1.0 + a / 16.0) * 2f64.powi(b))
}
