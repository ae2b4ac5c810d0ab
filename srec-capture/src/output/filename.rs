//! Filename sanitization for cross-platform output paths.
//!
//! Invalid characters are replaced while valid Unicode (CJK titles are the
//! common case) is kept as is.

/// Characters that are invalid in Windows filenames, plus the backtick which
/// breaks shell-driven post-processing.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '`'];

/// Windows reserved filenames (case-insensitive)
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const EMPTY_NAME: &str = "unnamed";

/// Sanitize a string for use as a filename on all platforms.
///
/// 1. Control characters and [`INVALID_CHARS`] become `_`
/// 2. Consecutive replacements collapse into one
/// 3. Leading/trailing spaces and dots are trimmed
/// 4. Windows reserved names get a `_` prefix
/// 5. An empty result becomes `unnamed`
///
/// ```
/// use srec_capture::output::sanitize_filename;
///
/// assert_eq!(sanitize_filename("hello?world"), "hello_world");
/// assert_eq!(sanitize_filename("观看一只青蛙?"), "观看一只青蛙_");
/// assert_eq!(sanitize_filename(""), "unnamed");
/// assert_eq!(sanitize_filename("CON"), "_CON");
/// ```
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;

    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return EMPTY_NAME.to_string();
    }

    let upper = trimmed.to_uppercase();
    for reserved in WINDOWS_RESERVED_NAMES {
        if upper == *reserved || upper.starts_with(&format!("{reserved}.")) {
            return format!("_{trimmed}");
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string() {
        assert_eq!(sanitize_filename(""), "unnamed");
        assert_eq!(sanitize_filename(" .. "), "unnamed");
    }

    #[test]
    fn test_only_invalid_characters() {
        assert_eq!(sanitize_filename("???"), "_");
        assert_eq!(sanitize_filename("<>:"), "_");
    }

    #[test]
    fn test_control_characters_and_backtick() {
        assert_eq!(sanitize_filename("a\nb\tc"), "a_b_c");
        assert_eq!(sanitize_filename("a\u{0}\u{c}b"), "a_b");
        assert_eq!(sanitize_filename("`cmd`"), "_cmd_");
    }

    #[test]
    fn test_windows_reserved_names() {
        assert_eq!(sanitize_filename("CON"), "_CON");
        assert_eq!(sanitize_filename("con"), "_con");
        assert_eq!(sanitize_filename("LPT1"), "_LPT1");
        assert_eq!(sanitize_filename("nul.flv"), "_nul.flv");
        assert_eq!(sanitize_filename("CONSOLE"), "CONSOLE");
    }

    #[test]
    fn test_leading_trailing_spaces_and_dots() {
        assert_eq!(sanitize_filename("  hello  "), "hello");
        assert_eq!(sanitize_filename("...hello..."), "hello");
    }

    #[test]
    fn test_unicode_preserved() {
        assert_eq!(sanitize_filename("观看一只青蛙"), "观看一只青蛙");
        assert_eq!(sanitize_filename("こんにちは"), "こんにちは");
        assert_eq!(sanitize_filename("안녕하세요"), "안녕하세요");
    }

    #[test]
    fn test_path_separators_replaced() {
        assert_eq!(sanitize_filename("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_filename("a\\b/c"), "a_b_c");
    }
}
