//! Deterministic sanitization of composition service names into cluster names.

/// Encode a service name into a form acceptable as a cluster resource name
/// component (lowercase RFC 1123 label characters). Lowercases ASCII letters,
/// keeps digits, and collapses every other run of characters into a single
/// `-`. Leading and trailing dashes are stripped; an empty result becomes
/// `"x"` so the caller always gets a usable component.
///
/// The encoding is deterministic but not injective: the engine checks for
/// collisions between encoded names and rejects them.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut dash_pending = false;
    for c in name.chars() {
        let mapped = match c {
            'a'..='z' | '0'..='9' => Some(c),
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            _ => None,
        };
        match mapped {
            Some(c) => {
                if dash_pending && !out.is_empty() {
                    out.push('-');
                }
                dash_pending = false;
                out.push(c);
            }
            None => dash_pending = true,
        }
    }
    if out.is_empty() {
        out.push('x');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::encode_name;

    #[test]
    fn passes_through_simple_names() {
        assert_eq!(encode_name("db"), "db");
        assert_eq!(encode_name("api2"), "api2");
    }

    #[test]
    fn lowercases_and_collapses() {
        assert_eq!(encode_name("My_Service"), "my-service");
        assert_eq!(encode_name("a..b"), "a-b");
        assert_eq!(encode_name("web.1"), "web-1");
    }

    #[test]
    fn strips_leading_and_trailing_separators() {
        assert_eq!(encode_name("_db_"), "db");
        assert_eq!(encode_name("--a--"), "a");
    }

    #[test]
    fn never_returns_empty() {
        assert_eq!(encode_name(""), "x");
        assert_eq!(encode_name("___"), "x");
    }

    #[test]
    fn is_deterministic_but_not_injective() {
        assert_eq!(encode_name("a.b"), encode_name("a_b"));
    }
}
