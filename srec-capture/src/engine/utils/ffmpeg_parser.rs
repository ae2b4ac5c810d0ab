//! Parsing of ffmpeg's stderr status output.
//!
//! Status lines look like
//! `frame=  100 fps=25 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x`.

/// One parsed status line.
#[derive(Debug, Clone, PartialEq)]
pub struct FfmpegProgress {
    /// Bytes written so far (cumulative).
    pub total_bytes: u64,
    /// Media time written so far in seconds.
    pub time_secs: f64,
    /// Raw bitrate label, e.g. `2097.2kbits/s`.
    pub bitrate: String,
}

/// Parse `HH:MM:SS.ms` into seconds.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let mut parts = time_str.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse the `size=` field (kB) into bytes.
pub fn parse_size(line: &str) -> Option<u64> {
    let size_start = line.find("size=")?;
    let size_str = &line[size_start + 5..].trim_start();
    let end = size_str.find(['k', 'K'])?;
    let size: u64 = size_str[..end].trim().parse().ok()?;
    Some(size * 1024)
}

/// Raw value of the `bitrate=` field, e.g. `2097.2kbits/s` or `N/A`.
pub fn parse_bitrate_label(line: &str) -> Option<String> {
    let start = line.find("bitrate=")?;
    let rest = line[start + 8..].trim_start();
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let label = &rest[..end];
    (!label.is_empty()).then(|| label.to_string())
}

/// Parse the `time=` field into seconds.
pub fn parse_time_field(line: &str) -> Option<f64> {
    let time_start = line.find("time=")?;
    let time_str = &line[time_start + 5..];
    let end = time_str.find(' ').unwrap_or(time_str.len());
    parse_time(&time_str[..end])
}

/// Parse a status line. `time=` plus `frame=` or `size=` is required so
/// unrelated lines are not mistaken for progress.
pub fn parse_progress(line: &str) -> Option<FfmpegProgress> {
    if !line.contains("time=") || !(line.contains("frame=") || line.contains("size=")) {
        return None;
    }

    Some(FfmpegProgress {
        total_bytes: parse_size(line).unwrap_or(0),
        time_secs: parse_time_field(line).unwrap_or(0.0),
        bitrate: parse_bitrate_label(line).unwrap_or_default(),
    })
}

/// ffmpeg prints this once the output is open and data starts flowing.
pub fn is_ready_banner(line: &str) -> bool {
    line.contains("Press [q] to stop")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("00:00:10.50"), Some(10.5));
        assert_eq!(parse_time("01:30:00.00"), Some(5400.0));
        assert_eq!(parse_time("invalid"), None);
        assert_eq!(parse_time("00:00"), None);
        assert_eq!(parse_time("00:00:00:00"), None);
    }

    #[test]
    fn test_parse_size() {
        let line = "frame=  100 fps=25 q=-1.0 size=    1024kB time=00:00:04.00";
        assert_eq!(parse_size(line), Some(1024 * 1024));
        assert_eq!(parse_size("size=512KB time=00:00:10.00"), Some(512 * 1024));
        assert_eq!(parse_size("no size here"), None);
        assert_eq!(parse_size("size=N/A time=00:00:10.00"), None);
    }

    #[test]
    fn test_parse_bitrate_label() {
        let line = "size=1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x";
        assert_eq!(parse_bitrate_label(line), Some("2097.2kbits/s".to_string()));
        assert_eq!(
            parse_bitrate_label("bitrate= 512.0kbits/s"),
            Some("512.0kbits/s".to_string())
        );
        assert_eq!(parse_bitrate_label("bitrate=N/A speed=N/A"), Some("N/A".to_string()));
        assert_eq!(parse_bitrate_label("no bitrate"), None);
    }

    #[test]
    fn test_parse_progress() {
        let line = "frame=  100 fps=25 q=-1.0 size=    1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1.00x";
        let p = parse_progress(line).unwrap();
        assert_eq!(p.total_bytes, 1024 * 1024);
        assert_eq!(p.time_secs, 4.0);
        assert_eq!(p.bitrate, "2097.2kbits/s");
    }

    #[test]
    fn test_parse_progress_without_size() {
        let line = "frame=  100 fps=25 q=-1.0 time=00:00:04.00 bitrate=2097.2kbits/s";
        let p = parse_progress(line).unwrap();
        assert_eq!(p.total_bytes, 0);
        assert_eq!(p.time_secs, 4.0);
    }

    #[test]
    fn test_non_progress_lines() {
        assert!(parse_progress("time=00:00:10.00").is_none());
        assert!(parse_progress("frame=100 fps=25 q=-1.0").is_none());
        assert!(parse_progress("Input #0, flv, from 'http://x':").is_none());
    }

    #[test]
    fn test_ready_banner() {
        assert!(is_ready_banner("Press [q] to stop, [?] for help"));
        assert!(!is_ready_banner("Stream mapping:"));
    }
}
