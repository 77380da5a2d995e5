// Helpers for reporting shard sizes in human-readable form

pub fn bytes2hr(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let value = bytes as f64;
    if bytes < 1024 {
        format!("{bytes} bytes")
    } else if value < KB * KB {
        format!("{:.2} KB", value / KB)
    } else if value < KB * KB * KB {
        format!("{:.2} MB", value / (KB * KB))
    } else {
        format!("{:.2} GB", value / (KB * KB * KB))
    }
}

pub fn bits2hr(bits: u64) -> String {
    bytes2hr(bits.div_ceil(8))
}

/// Bytes a shard occupies once its highest offset has been written.
pub fn shard_footprint(bit_width: u32) -> u64 {
    (1u64 << bit_width).div_ceil(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(bytes2hr(512), "512 bytes");
        assert_eq!(bytes2hr(2048), "2.00 KB");
        assert_eq!(bits2hr(8 * 1024 * 1024), "1.00 MB");
        assert_eq!(shard_footprint(32), 512 * 1024 * 1024);
        assert_eq!(bytes2hr(shard_footprint(32)), "512.00 MB");
        assert_eq!(shard_footprint(1), 1);
    }
}
