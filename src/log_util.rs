//! Smol utilities for logging

use std::ascii;
use std::borrow::Cow;

/// Make an Ascii-safe string
pub fn ascii_escape(s: &[u8]) -> String {
    s.iter().flat_map(|&b| ascii::escape_default(b)).map(char::from).collect()
}

/// Double any `"` so the text can sit inside a quoted CSV field
pub fn csv_escape(s: &str) -> Cow<str> {
    if s.contains('"') {
        Cow::Owned(s.replace('"', "\"\""))
    }
    else {
        Cow::Borrowed(s)
    }
}

/// Escape text for inclusion in an HTML error page
pub fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c)
        }
    }
    out
}

#[test]
fn ascii_escape_control_bytes() {
    assert_eq!(ascii_escape(b"oops\r\n\xff"), "oops\\r\\n\\xff");
}

#[test]
fn csv_escape_doubles_quotes() {
    assert_eq!(csv_escape("say \"hi\""), "say \"\"hi\"\"");
    assert_eq!(csv_escape("plain"), "plain");
}

#[test]
fn html_escape_markup() {
    assert_eq!(html_escape("<a href='x'>&</a>"),
               "&lt;a href=&#39;x&#39;&gt;&amp;&lt;/a&gt;");
}
