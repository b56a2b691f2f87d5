//! Size helper functions.
//!
//! Device sizes are `u64` (matching `VkDeviceSize`), so these helpers are too.

/// Convert kibibytes to bytes.
#[inline]
pub const fn kb(n: u64) -> u64 {
    n * 1024
}

/// Convert mebibytes to bytes.
#[inline]
pub const fn mb(n: u64) -> u64 {
    n * 1024 * 1024
}

/// Convert gibibytes to bytes.
#[inline]
pub const fn gb(n: u64) -> u64 {
    n * 1024 * 1024 * 1024
}

/// Format bytes as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_conversions() {
        assert_eq!(kb(1), 1024);
        assert_eq!(mb(16), 16 * 1024 * 1024);
        assert_eq!(gb(1), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(mb(16)), "16.00 MB");
        assert_eq!(format_bytes(gb(2)), "2.00 GB");
    }
}
