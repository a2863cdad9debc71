//! Shell helpers: quoting free-form text and chunking it for `xdotool type`.

/// Quote a string for safe substitution into a POSIX shell command line.
///
/// Empty strings become `''`. Strings made only of word characters and
/// `@%+=:,./-` pass through unchanged. Anything else is wrapped in single
/// quotes, with embedded single quotes written as `'"'"'`.
pub fn quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if s.chars().all(is_safe_char) {
        return s.to_string();
    }

    // $'b is quoted as '$'"'"'b'
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-')
}

/// Iterator over consecutive pieces of at most `size` characters.
///
/// Splits on `char` boundaries, so multi-byte text is never cut in half.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    rest: &'a str,
    size: usize,
}

/// Break `text` into pieces of `size` characters (the last may be shorter).
///
/// A `size` of zero is treated as one.
pub fn chunks(text: &str, size: usize) -> Chunks<'_> {
    Chunks {
        rest: text,
        size: size.max(1),
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        let end = self
            .rest
            .char_indices()
            .nth(self.size)
            .map(|(i, _)| i)
            .unwrap_or(self.rest.len());
        let (head, tail) = self.rest.split_at(end);
        self.rest = tail;
        Some(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal POSIX tokenizer for the quoting forms `quote` produces.
    fn shell_split(line: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut in_token = false;
        let mut chars = line.chars();
        while let Some(c) = chars.next() {
            match c {
                '\'' => {
                    in_token = true;
                    for q in chars.by_ref() {
                        if q == '\'' {
                            break;
                        }
                        current.push(q);
                    }
                }
                '"' => {
                    in_token = true;
                    for q in chars.by_ref() {
                        if q == '"' {
                            break;
                        }
                        current.push(q);
                    }
                }
                ' ' => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                other => {
                    in_token = true;
                    current.push(other);
                }
            }
        }
        if in_token {
            tokens.push(current);
        }
        tokens
    }

    #[test]
    fn test_quote_empty() {
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_quote_safe_passthrough() {
        for s in ["hello", "a_b-c.d/e", "user@host:8080", "x=1,y=2%", "+42"] {
            assert_eq!(quote(s), s);
        }
    }

    #[test]
    fn test_quote_wraps_unsafe() {
        assert_eq!(quote("hello world"), "'hello world'");
        assert_eq!(quote("$HOME"), "'$HOME'");
        assert_eq!(quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn test_quote_round_trips_through_tokenizer() {
        for s in ["it's", "a 'b' c", "semi;colon && rm", "tab\there", "'"] {
            let line = format!("xdotool type {}", quote(s));
            let tokens = shell_split(&line);
            assert_eq!(tokens.len(), 3, "line: {line}");
            assert_eq!(tokens[2], s);
        }
    }

    #[test]
    fn test_chunks_fixed_size() {
        let parts: Vec<&str> = chunks("abcdefghij", 4).collect();
        assert_eq!(parts, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_chunks_empty_and_multibyte() {
        assert_eq!(chunks("", 25).count(), 0);

        let parts: Vec<&str> = chunks("héllo wörld", 3).collect();
        assert_eq!(parts, vec!["hél", "lo ", "wör", "ld"]);
        assert_eq!(parts.concat(), "héllo wörld");
    }

    #[test]
    fn test_chunks_zero_size_is_one() {
        assert_eq!(chunks("abc", 0).count(), 3);
    }
}
