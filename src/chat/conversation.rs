//! Conversation titles and expiry

use chrono::{DateTime, TimeDelta, Utc};

pub const DEFAULT_TITLE_MAX_CHARS: usize = 50;

/// Title derived from the first message of a conversation
///
/// Whitespace is collapsed, the text is capped at `max_chars` characters
/// (with a trailing ellipsis when cut) and then HTML-escaped, so the stored
/// title is safe to render verbatim.
pub fn derive_title(message: &str, max_chars: usize) -> String {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    let title = if collapsed.chars().count() > max_chars {
        let cut: String = collapsed.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    } else {
        collapsed
    };
    html_escape(&title)
}

pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Fixed once at creation; 0 retention days means never
pub fn expires_at(created_at: DateTime<Utc>, retention_days: u32) -> Option<DateTime<Utc>> {
    if retention_days == 0 {
        None
    } else {
        Some(created_at + TimeDelta::days(i64::from(retention_days)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_title_is_capped_and_escaped() {
        let title = derive_title("<b>Who</b> is on leave   next week?", 50);
        assert_eq!(title, "&lt;b&gt;Who&lt;/b&gt; is on leave next week?");

        let long = "x".repeat(80);
        let title = derive_title(&long, 50);
        assert_eq!(title, format!("{}...", "x".repeat(50)));
    }

    #[test]
    fn test_cap_counts_characters_not_bytes() {
        let title = derive_title(&"é".repeat(60), 50);
        assert_eq!(title.chars().count(), 53);
    }

    #[test]
    fn test_expiry_from_retention_days() {
        let created = Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap();
        assert_eq!(expires_at(created, 0), None);
        assert_eq!(
            expires_at(created, 7),
            Some(Utc.with_ymd_and_hms(2026, 2, 6, 12, 0, 0).unwrap())
        );
    }
}
