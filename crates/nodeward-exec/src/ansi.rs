//! ANSI color sequence removal.

use once_cell::sync::Lazy;
use regex::Regex;

static SGR_SEQUENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("Invalid regex pattern for SGR sequences"));

/// Remove SGR (color/style) escape sequences from `text`.
pub fn strip_ansi(text: &str) -> String {
    SGR_SEQUENCE.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_colors() {
        assert_eq!(strip_ansi("\x1b[1;31merror\x1b[0m: bad"), "error: bad");
        assert_eq!(strip_ansi("\x1b[m"), "");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(strip_ansi("no escapes here\n"), "no escapes here\n");
    }

    #[test]
    fn test_other_escapes_are_kept() {
        // Cursor movement is not a color sequence.
        assert_eq!(strip_ansi("\x1b[2Kline"), "\x1b[2Kline");
    }
}
