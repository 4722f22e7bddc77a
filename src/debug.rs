use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};

pub static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable_debug() {
    DEBUG_ENABLED.store(true, Ordering::Relaxed);
}

pub fn disable_debug() {
    DEBUG_ENABLED.store(false, Ordering::Relaxed);
}

pub fn is_debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

const HEX_WIDTH: usize = 16;

/// Renders `data` as an offset/hex/ascii listing, one row per 16 bytes.
pub fn hex_listing(data: &[u8], base: usize) -> String {
    let mut out = String::new();

    for (row, chunk) in data.chunks(HEX_WIDTH).enumerate() {
        let _ = write!(out, "{:#014x}:", base + row * HEX_WIDTH);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
        for _ in chunk.len()..HEX_WIDTH {
            out.push_str("   ");
        }
        out.push_str("  ");
        for &c in chunk {
            out.push(if (0x20..0x7f).contains(&c) { c as char } else { '.' });
        }
        out.push('\n');
    }

    out
}

/// Dumps generated code through `tracing` when debugging is on.
pub fn log_code(mark: &str, data: &[u8], base: usize) {
    if !is_debug_enabled() {
        return;
    }
    tracing::trace!(target: "unihook::code", "[{}] {} bytes\n{}", mark, data.len(), hex_listing(data, base));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_pads_short_rows() {
        let text = hex_listing(&[0x48, 0x89, 0xe5, 0x41], 0x1000);
        let line = text.lines().next().unwrap();
        assert!(line.starts_with("0x000000001000: 48 89 e5 41"));
        assert!(line.ends_with("H..A"));
    }

    #[test]
    fn listing_splits_rows() {
        let data = [0x90u8; 20];
        let text = hex_listing(&data, 0);
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().nth(1).unwrap().starts_with("0x000000000010:"));
    }
}
