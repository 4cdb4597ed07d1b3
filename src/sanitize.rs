//! Scrubbing of untrusted request strings
//!
//! Request paths and Host headers are restricted to the byte set
//! `[0-9a-zA-Z,-./:_~]`. Paths get every other byte rewritten to `'_'`; a
//! Host header carrying any other byte is refused outright. Nothing is ever
//! percent-decoded: a `%XX` escape collapses into a single `'_'`, so an
//! escaped `..` or `/` can never reappear further down the line.

/// Returns `true` iff the byte may appear in a path or Host header.
#[inline]
pub fn is_allowed(b: u8) -> bool {
    b.is_ascii_alphanumeric() ||
    b == b',' || b == b'-' || b == b'.' || b == b'/' ||
    b == b':' || b == b'_' || b == b'~'
}

/// Rewrites a request path so that only allowed bytes remain.
///
/// Returns the scrubbed path and the number of rewrites made (`0` means the
/// input came back unchanged). A `'%'` followed by at least two more bytes
/// counts as one rewrite, whatever those bytes are.
pub fn sanitize_path_chars<P: AsRef<[u8]>>(path: P) -> (String, usize) {
    let bytes = path.as_ref();
    let mut out = String::with_capacity(bytes.len());
    let mut changes = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if is_allowed(b) {
            out.push(b as char);
            i += 1;
            continue;
        }

        changes += 1;
        out.push('_');
        i += if b == b'%' && i + 2 < bytes.len() { 3 } else { 1 };
    }

    (out, changes)
}

/// Checks a Host header value. Any disallowed byte rejects the whole value.
pub fn validate_host_header(host: &str) -> bool {
    host.bytes().all(is_allowed)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clean_paths_pass_unchanged() {
        let (out, n) = sanitize_path_chars("/a-b/c_d/e.f,g:h~i/0123");
        assert_eq!(out, "/a-b/c_d/e.f,g:h~i/0123");
        assert_eq!(n, 0);
    }

    #[test]
    fn disallowed_bytes_become_underscores() {
        let (out, n) = sanitize_path_chars("/<script>alert(1)</script>");
        assert_eq!(out, "/_script_alert_1__/script_");
        assert_eq!(n, 6);
    }

    #[test]
    fn percent_escapes_fold_to_one_underscore() {
        let (out, n) = sanitize_path_chars("/%2e%2e/%2fetc");
        assert_eq!(out, "/__/_etc");
        assert_eq!(n, 3);
    }

    #[test]
    fn percent_escape_need_not_be_hex() {
        let (out, n) = sanitize_path_chars("/bogus%zz.html");
        assert_eq!(out, "/bogus_.html");
        assert_eq!(n, 1);
    }

    #[test]
    fn trailing_percent_is_a_single_byte() {
        assert_eq!(sanitize_path_chars("/a%").0, "/a_");
        assert_eq!(sanitize_path_chars("/a%4").0, "/a_4");
    }

    #[test]
    fn multibyte_characters_fold_per_byte() {
        let (out, n) = sanitize_path_chars("/caf\u{e9}");
        assert_eq!(out, "/caf__");
        assert_eq!(n, 2);
    }

    #[test]
    fn raw_bytes_fold_one_for_one() {
        let (out, n) = sanitize_path_chars(&b"/a\xffb"[..]);
        assert_eq!(out, "/a_b");
        assert_eq!(n, 1);

        let (out, n) = sanitize_path_chars(&b"/a%\xff\xfeb"[..]);
        assert_eq!(out, "/a_b");
        assert_eq!(n, 1);
    }

    #[test]
    fn sanitizing_is_idempotent() {
        let inputs = ["/", "/%41%42/x y", "/..%2f..", "/\u{1F980}?q", "%%%%",
                      "/a%b%c%d", "/ok/path.html"];
        for input in inputs.iter() {
            let (once, _) = sanitize_path_chars(input);
            let (twice, n) = sanitize_path_chars(&once);
            assert_eq!(once, twice);
            assert_eq!(n, 0);
        }
    }

    #[test]
    fn every_escape_folds_to_exactly_one_underscore() {
        for byte in 0u16..256 {
            let escaped = format!("/x%{:02X}y", byte);
            let (out, n) = sanitize_path_chars(&escaped);
            assert_eq!(out, "/x_y");
            assert_eq!(n, 1);
        }
    }

    #[test]
    fn host_validation() {
        assert!(validate_host_header("www.example.com:8080"));
        assert!(validate_host_header("EXAMPLE_com"));
        assert!(!validate_host_header("example.com\r\nX: y"));
        assert!(!validate_host_header("[::1]:80"));
        assert!(!validate_host_header("a%2fb"));
    }
}
