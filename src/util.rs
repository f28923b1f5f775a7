use std::ascii;

/// Renders a byte payload for logs, escaping anything that is not printable
/// ASCII.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input
        .iter()
        .flat_map(|&c| ascii::escape_default(c))
        .map(char::from)
        .collect()
}

/// Seconds since the epoch.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_binary() {
        assert_eq!(bytes_to_human_str(b"echo hi\n"), "echo hi\\n");
        assert_eq!(bytes_to_human_str(&[0, 0xff]), "\\x00\\xff");
        assert_eq!(bytes_to_human_str(b""), "");
    }
}
