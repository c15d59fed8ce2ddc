//! POSIX shell quoting.
//!
//! Job commands run through `sh -c`, so every parameter value that is
//! substituted into a command line must be escaped against word splitting
//! and metacharacter interpretation.

/// Quote a string so `sh` treats it as a single literal word.
///
/// Strings made up entirely of shell-safe characters pass through
/// unchanged. Anything else is wrapped in single quotes, with embedded
/// single quotes spliced as `'"'"'` (close quote, double-quoted `'`,
/// reopen quote). The empty string quotes to `''` so it survives as an
/// argument at all.
pub fn quote_for_shell(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if s.chars().all(is_shell_safe) {
        return s.to_string();
    }

    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            quoted.push_str("'\"'\"'");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Characters that never need quoting in a POSIX shell word.
fn is_shell_safe(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string() {
        assert_eq!(quote_for_shell(""), "''");
    }

    #[test]
    fn test_safe_strings_pass_through() {
        assert_eq!(quote_for_shell("abc"), "abc");
        assert_eq!(quote_for_shell("a-b_c.d/e"), "a-b_c.d/e");
        assert_eq!(quote_for_shell("user@host:path,v2+x%3=1"), "user@host:path,v2+x%3=1");
        assert_eq!(quote_for_shell("0.01"), "0.01");
    }

    #[test]
    fn test_spaces_are_quoted() {
        assert_eq!(quote_for_shell("a b"), "'a b'");
        assert_eq!(quote_for_shell(" leading"), "' leading'");
    }

    #[test]
    fn test_metacharacters_are_quoted() {
        assert_eq!(quote_for_shell("a;b"), "'a;b'");
        assert_eq!(quote_for_shell("$(ls)"), "'$(ls)'");
        assert_eq!(quote_for_shell("a|b&c"), "'a|b&c'");
        assert_eq!(quote_for_shell("*.txt"), "'*.txt'");
    }

    #[test]
    fn test_embedded_single_quote() {
        assert_eq!(quote_for_shell("a'b"), "'a'\"'\"'b'");
        assert_eq!(quote_for_shell("'"), "''\"'\"''");
    }

    #[test]
    fn test_non_ascii_is_quoted() {
        // Safe set is ASCII only; anything else gets wrapped.
        assert_eq!(quote_for_shell("café"), "'café'");
    }
}
