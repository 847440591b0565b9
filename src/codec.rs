//! Conversion between native values and the big-endian external representation

use crate::error::{CdfError, Result};
use crate::types::ElementType;
use num_traits::{cast, NumCast};

/// Native numeric types that can be stored in or read from any numeric
/// external type. Conversions are range checked.
pub trait Element: Copy + Default + NumCast + 'static {}

impl Element for i8 {}
impl Element for u8 {}
impl Element for i16 {}
impl Element for u16 {}
impl Element for i32 {}
impl Element for u32 {}
impl Element for i64 {}
impl Element for u64 {}
impl Element for f32 {}
impl Element for f64 {}

fn reject_char(ty: ElementType) -> Result<()> {
    if ty == ElementType::Char {
        return Err(CdfError::CharConversion(
            "use the text accessors for char data".to_string(),
        ));
    }
    Ok(())
}

/// Encode `values` as `ty` into `out`, which must hold exactly
/// `values.len() * ty.size_in_bytes()` bytes.
///
/// Every value is converted; a value that does not fit is replaced with the
/// type's default fill and counted. Returns the number of such values.
pub fn encode_values<T: Element>(ty: ElementType, values: &[T], out: &mut [u8]) -> Result<usize> {
    reject_char(ty)?;
    let width = ty.size_in_bytes();
    debug_assert_eq!(out.len(), values.len() * width);

    let fill = ty.default_fill();
    let mut failures = 0;
    for (value, dst) in values.iter().zip(out.chunks_exact_mut(width)) {
        if !put_one(ty, *value, dst) {
            dst.copy_from_slice(&fill);
            failures += 1;
        }
    }
    Ok(failures)
}

fn put_one<T: NumCast>(ty: ElementType, value: T, dst: &mut [u8]) -> bool {
    match ty {
        ElementType::Byte => cast::<T, i8>(value).map(|v| dst.copy_from_slice(&v.to_be_bytes())),
        ElementType::Short => cast::<T, i16>(value).map(|v| dst.copy_from_slice(&v.to_be_bytes())),
        ElementType::Int => cast::<T, i32>(value).map(|v| dst.copy_from_slice(&v.to_be_bytes())),
        ElementType::Float => cast::<T, f32>(value).map(|v| dst.copy_from_slice(&v.to_be_bytes())),
        ElementType::Double => cast::<T, f64>(value).map(|v| dst.copy_from_slice(&v.to_be_bytes())),
        ElementType::Char => None,
    }
    .is_some()
}

/// Decode `src` (external `ty` values) into `out`.
///
/// Values that do not fit `T` are left at `T::default()` and counted.
pub fn decode_values<T: Element>(ty: ElementType, src: &[u8], out: &mut [T]) -> Result<usize> {
    reject_char(ty)?;
    let width = ty.size_in_bytes();
    debug_assert_eq!(src.len(), out.len() * width);

    let mut failures = 0;
    for (bytes, dst) in src.chunks_exact(width).zip(out.iter_mut()) {
        match get_one::<T>(ty, bytes) {
            Some(v) => *dst = v,
            None => {
                *dst = T::default();
                failures += 1;
            }
        }
    }
    Ok(failures)
}

fn get_one<T: NumCast>(ty: ElementType, src: &[u8]) -> Option<T> {
    match ty {
        ElementType::Byte => cast(i8::from_be_bytes([src[0]])),
        ElementType::Short => cast(i16::from_be_bytes([src[0], src[1]])),
        ElementType::Int => cast(i32::from_be_bytes([src[0], src[1], src[2], src[3]])),
        ElementType::Float => cast(f32::from_be_bytes([src[0], src[1], src[2], src[3]])),
        ElementType::Double => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(src);
            cast(f64::from_be_bytes(raw))
        }
        ElementType::Char => None,
    }
}

/// Repeat a one-element fill pattern across `out`.
pub fn fill_with(pattern: &[u8], out: &mut [u8]) {
    debug_assert!(!pattern.is_empty());
    for chunk in out.chunks_mut(pattern.len()) {
        chunk.copy_from_slice(&pattern[..chunk.len()]);
    }
}

/// Turn a count of failed conversions into the call's result.
pub(crate) fn range_result(failures: usize) -> Result<()> {
    if failures == 0 {
        Ok(())
    } else {
        Err(CdfError::Range(failures))
    }
}
