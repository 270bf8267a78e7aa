//! Calibration-driven quantization parameters.
//!
//! All quantization math in the operators goes through these functions so
//! the rounding and clamping policy lives in one place. The convention is
//! `real = quantized * scale` for symmetric signed types and
//! `real = (quantized - zero_point) * scale` for unsigned ones.

use crate::core::buffer::DType;
use half::{bf16, f16};

/// Range guard so a degenerate calibration pair still yields a usable,
/// strictly positive scale.
const EPS: f32 = 1e-10;

fn full_range(dtype: DType) -> f32 {
    match dtype {
        DType::U8 => u8::MAX as f32,
        DType::S8 => i8::MAX as f32, // symmetric half-range
        DType::S32 => i32::MAX as f32,
        DType::F16 => f16::MAX.to_f32(),
        DType::BF16 => bf16::MAX.to_f32(),
        DType::F32 => f32::MAX,
    }
}

/// Derive the quantization scale for a (min, max) calibration pair.
///
/// Unsigned targets span the full observed range; symmetric signed targets
/// use the larger absolute bound over the half range. Float targets carry
/// no quantization and get scale 1. The result is always > 0.
pub fn scale(min: f32, max: f32, dtype: DType) -> f32 {
    if dtype.is_float() {
        return 1.0;
    }
    if dtype.is_symmetric_int() {
        let abs_max = min.abs().max(max.abs()).max(EPS);
        abs_max / full_range(dtype)
    } else {
        let range = (max - min).max(EPS);
        range / full_range(dtype)
    }
}

/// Derive the zero point matching `scale(min, max, dtype)`.
///
/// Zero for symmetric signed and float targets; otherwise `round(-min/scale)`
/// clamped to the dtype's representable bounds.
pub fn zero_point(min: f32, scale: f32, dtype: DType) -> i32 {
    if dtype.is_float() || dtype.is_symmetric_int() {
        return 0;
    }
    let zp = (-min / scale).round();
    match dtype {
        DType::U8 => zp.clamp(u8::MIN as f32, u8::MAX as f32) as i32,
        _ => zp as i32,
    }
}

/// Fold two or three scales into one multiplicative correction.
///
/// With an output scale the result converts an integer accumulator product
/// straight into output quantized units; without one it dequantizes to real
/// values.
pub fn rescale(scale_a: f32, scale_b: f32, scale_out: Option<f32>) -> f32 {
    match scale_out {
        Some(out) => scale_a * scale_b / out,
        None => scale_a * scale_b,
    }
}
