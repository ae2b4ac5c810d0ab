//! Output name templates.
//!
//! Supported placeholders:
//! - `{streamer}`, `{title}`, `{platform}` - job values
//! - `%Y` `%m` `%d` `%H` `%M` `%S` - local date and time of the capture start
//! - `%t` - Unix timestamp
//! - `%%` - Literal percent sign
//!
//! Unknown `{name}` and `%x` sequences are kept literally. Expansion is a
//! single pass, so `%` or braces inside job values are never expanded again.

use chrono::{DateTime, Datelike, Local, Timelike};

use super::filename::sanitize_filename;

/// Job values substituted into templates.
#[derive(Debug, Clone, Copy)]
pub struct TemplateValues<'a> {
    pub streamer: &'a str,
    pub title: &'a str,
    pub platform: &'a str,
}

impl TemplateValues<'_> {
    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "streamer" => Some(self.streamer),
            "title" => Some(self.title),
            "platform" => Some(self.platform),
            _ => None,
        }
    }
}

/// Expand a filename template. The whole result is sanitized.
pub fn expand_filename_template(
    template: &str,
    values: &TemplateValues<'_>,
    at: DateTime<Local>,
) -> String {
    sanitize_filename(&expand_template_internal(template, values, at, false))
}

/// Expand a folder template.
///
/// The template itself may contain separators and drive letters; substituted
/// job values are sanitized so they cannot add path segments.
pub fn expand_folder_template(
    template: &str,
    values: &TemplateValues<'_>,
    at: DateTime<Local>,
) -> String {
    expand_template_internal(template, values, at, true)
}

fn expand_template_internal(
    template: &str,
    values: &TemplateValues<'_>,
    at: DateTime<Local>,
    sanitize_values: bool,
) -> String {
    let mut result = String::with_capacity(template.len() * 2);
    let mut chars = template.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match c {
            '%' => match chars.peek().map(|&(_, next)| next) {
                Some(next) => {
                    let expanded = match next {
                        'Y' => Some(format!("{:04}", at.year())),
                        'm' => Some(format!("{:02}", at.month())),
                        'd' => Some(format!("{:02}", at.day())),
                        'H' => Some(format!("{:02}", at.hour())),
                        'M' => Some(format!("{:02}", at.minute())),
                        'S' => Some(format!("{:02}", at.second())),
                        't' => Some(at.timestamp().to_string()),
                        '%' => Some("%".to_string()),
                        _ => None,
                    };
                    match expanded {
                        Some(s) => {
                            result.push_str(&s);
                            chars.next();
                        }
                        // Unrecognized placeholder, the next char is emitted by the loop
                        None => result.push('%'),
                    }
                }
                None => result.push('%'),
            },
            '{' => {
                let rest = &template[idx + 1..];
                let value = rest
                    .find('}')
                    .and_then(|end| values.lookup(&rest[..end]).map(|v| (end, v)));
                match value {
                    Some((end, value)) => {
                        if sanitize_values {
                            result.push_str(&sanitize_filename(value));
                        } else {
                            result.push_str(value);
                        }
                        // skip the key and the closing brace
                        let key_chars = rest[..=end].chars().count();
                        for _ in 0..key_chars {
                            chars.next();
                        }
                    }
                    None => result.push('{'),
                }
            }
            _ => result.push(c),
        }
    }

    result
}
