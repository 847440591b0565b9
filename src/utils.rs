//! Utility functions

/// Round `value` up to a multiple of `alignment` (any non-zero alignment).
pub fn round_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value.div_ceil(alignment) * alignment
}

/// Round `value` up to the 4-byte boundary used by every header field.
pub fn pad4(value: usize) -> usize {
    (value + 3) & !3
}

/// Round a byte length up to a power-of-2 alignment
pub fn align_to_power_of_2(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 512), 0);
        assert_eq!(round_up(1, 512), 512);
        assert_eq!(round_up(100, 3), 102);
        assert_eq!(round_up(8192, 4096), 8192);
    }

    #[test]
    fn test_pad4() {
        assert_eq!(pad4(0), 0);
        assert_eq!(pad4(1), 4);
        assert_eq!(pad4(4), 4);
        assert_eq!(pad4(5), 8);
    }

    #[test]
    fn test_align_to_power_of_2() {
        assert_eq!(align_to_power_of_2(0, 16), 0);
        assert_eq!(align_to_power_of_2(1, 16), 16);
        assert_eq!(align_to_power_of_2(17, 16), 32);
    }
}
