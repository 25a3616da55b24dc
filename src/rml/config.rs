//! RML configuration: recognized environment options from spec.md §4.1.

/// Byte alignment eager buffers are rounded up to.
pub const ALIGNMENT: usize = 64;

fn round_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Parse a size with an optional `KB`/`MB`/`GB` suffix (case-insensitive),
/// e.g. `"4MB"`, `"512KB"`, or a bare byte count `"1048576"`.
fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    let upper = raw.to_ascii_uppercase();
    let (digits, multiplier) = if let Some(d) = upper.strip_suffix("GB") {
        (d, 1024 * 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("MB") {
        (d, 1024 * 1024)
    } else if let Some(d) = upper.strip_suffix("KB") {
        (d, 1024)
    } else {
        (upper.as_str(), 1)
    };
    digits.trim().parse::<usize>().ok().map(|n| n * multiplier)
}

/// Recognized RML environment options (spec.md §4.1).
#[derive(Clone, Copy, Debug)]
pub struct RmlConfig {
    /// Size of the eager buffer; payloads at or below this use the eager
    /// path, larger payloads use the huge-message rendezvous.
    pub max_msg_len: usize,
    /// Number of posted eager receive buffers. Minimum 2.
    pub n_recv: usize,
}

impl Default for RmlConfig {
    fn default() -> Self {
        Self {
            max_msg_len: round_up(3 * 512 * 1024, ALIGNMENT),
            n_recv: 4,
        }
    }
}

impl RmlConfig {
    /// Read `MAX_MSG_LEN` and `N_RECV` from the process environment,
    /// falling back to the documented defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var("MAX_MSG_LEN") {
            if let Some(bytes) = parse_size(&raw) {
                cfg.max_msg_len = round_up(bytes, ALIGNMENT);
            }
        }
        if let Ok(raw) = std::env::var("N_RECV") {
            if let Ok(n) = raw.trim().parse::<usize>() {
                cfg.n_recv = n.max(2);
            }
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_aligned() {
        let cfg = RmlConfig::default();
        assert_eq!(cfg.max_msg_len % ALIGNMENT, 0);
    }

    #[test]
    fn parses_unit_suffixes() {
        assert_eq!(parse_size("4MB"), Some(4 * 1024 * 1024));
        assert_eq!(parse_size("512KB"), Some(512 * 1024));
        assert_eq!(parse_size("1GB"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("1048576"), Some(1_048_576));
    }

    #[test]
    fn n_recv_has_a_floor_of_two() {
        // SAFETY: test-only, single-threaded test process env mutation.
        unsafe {
            std::env::set_var("N_RECV", "1");
        }
        let cfg = RmlConfig::from_env();
        assert!(cfg.n_recv >= 2);
        unsafe {
            std::env::remove_var("N_RECV");
        }
    }
}
