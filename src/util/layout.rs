//! Alignment arithmetic for device offsets.

/// Align an offset up to the given power-of-two alignment.
#[inline]
pub const fn align_up(offset: u64, align: u64) -> u64 {
    (offset + align - 1) & !(align - 1)
}

/// Padding needed to bring `offset` up to `align`.
#[inline]
pub const fn padding_for(offset: u64, align: u64) -> u64 {
    align_up(offset, align) - offset
}

/// Normalize a caller-supplied alignment.
///
/// Zero means "no requirement" and becomes 1. Anything that is not a power
/// of two is rejected.
#[inline]
pub fn normalize_alignment(align: u64) -> Option<u64> {
    match align {
        0 => Some(1),
        a if a.is_power_of_two() => Some(a),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 256), 256);
    }

    #[test]
    fn test_padding_for() {
        assert_eq!(padding_for(0, 8), 0);
        assert_eq!(padding_for(1, 8), 7);
        assert_eq!(padding_for(400, 16), 0);
        assert_eq!(padding_for(401, 16), 15);
    }

    #[test]
    fn test_normalize_alignment() {
        assert_eq!(normalize_alignment(0), Some(1));
        assert_eq!(normalize_alignment(64), Some(64));
        assert_eq!(normalize_alignment(48), None);
    }
}
