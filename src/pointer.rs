//! JSON Pointer (RFC 6901) parsing and encoding.
//!
//! The empty string addresses the document root. Every other pointer starts
//! with `/` and is split into segments; within a segment `~1` decodes to `/`
//! and `~0` to `~`, in that order.

/// Splits a pointer into decoded segments.
///
/// `""` yields no segments (the root); `"/"` yields a single empty segment
/// (the empty-string key of the root). A non-empty pointer without a leading
/// `/` is malformed.
pub fn parse(path: &str) -> Option<Vec<String>> {
    if path.is_empty() {
        return Some(Vec::new());
    }
    let rest = path.strip_prefix('/')?;
    Some(rest.split('/').map(decode_segment).collect())
}

/// Re-encodes segments into a canonical pointer, escaping `~` and `/`.
pub fn encode(segments: &[String]) -> String {
    let mut path = String::with_capacity(64);
    for segment in segments {
        path.push('/');
        for c in segment.chars() {
            match c {
                '/' => path.push_str("~1"),
                '~' => path.push_str("~0"),
                _ => path.push(c),
            }
        }
    }
    path
}

// ~1 must decode before ~0, otherwise "~01" would turn into "/".
fn decode_segment(segment: &str) -> String {
    if segment.contains('~') {
        segment.replace("~1", "/").replace("~0", "~")
    } else {
        segment.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_is_root() {
        assert_eq!(parse(""), Some(Vec::new()));
    }

    #[test]
    fn slash_is_empty_key() {
        assert_eq!(parse("/"), Some(vec![String::new()]));
    }

    #[test]
    fn plain_segments() {
        assert_eq!(
            parse("/users/0/name"),
            Some(vec!["users".to_string(), "0".to_string(), "name".to_string()])
        );
    }

    #[test]
    fn escapes_decode_in_order() {
        assert_eq!(parse("/a~1b"), Some(vec!["a/b".to_string()]));
        assert_eq!(parse("/m~0n"), Some(vec!["m~n".to_string()]));
        // "~01" is an escaped "~" followed by "1", never "/".
        assert_eq!(parse("/~01"), Some(vec!["~1".to_string()]));
    }

    #[test]
    fn missing_leading_slash_is_malformed() {
        assert_eq!(parse("users/0"), None);
    }

    #[test]
    fn encode_escapes() {
        let segments = vec!["a/b".to_string(), "m~n".to_string(), String::new()];
        assert_eq!(encode(&segments), "/a~1b/m~0n/");
    }

    #[test]
    fn round_trip_valid_pointers() {
        for p in ["/", "/a", "/a/b/c", "/a~1b", "/~0", "/~01", "//x", "/0/1/2"] {
            let segments = parse(p).expect(p);
            assert_eq!(encode(&segments), p, "round trip of {p:?}");
        }
    }
}
