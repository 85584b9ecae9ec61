/// Escape a SCRAM `username` attribute per RFC 5802 §5.1: `=` becomes `=3D`, `,` becomes `=2C`.
pub fn escape_scram_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '=' => out.push_str("=3D"),
            ',' => out.push_str("=2C"),
            _ => out.push(c),
        }
    }
    out
}

/// Split `user` on the first occurrence of `__` or `..`, returning (tenant_id, real_user).
/// Used by both the PG `user` startup parameter fallback and MySQL username-based
/// tenant discovery.
pub fn split_tenant_prefix(user: &str) -> Option<(&str, &str)> {
    let double_under = user.find("__");
    let double_dot = user.find("..");
    let idx = match (double_under, double_dot) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    if idx == 0 {
        return None;
    }
    Some((&user[..idx], &user[idx + 2..]))
}

/// Tokenize a PG `options` startup parameter the way libpq quotes it: whitespace
/// separated, `\` escapes the next character. Close enough to shell-word splitting to
/// find `-c tenant_id=X` or a bare `tenant_id=X` token.
pub fn split_options_tokens(options: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = options.chars();
    let mut in_token = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_token = true;
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Parse the tenant id from a PG `options` parameter. Accepts `-c tenant_id=X` (two
/// tokens) or a single bare `tenant_id=X` token, whichever is found first.
pub fn tenant_id_from_options(options: &str) -> Option<String> {
    let tokens = split_options_tokens(options);
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i] == "-c" && i + 1 < tokens.len() {
            if let Some(v) = tokens[i + 1].strip_prefix("tenant_id=") {
                return Some(v.to_string());
            }
            i += 2;
            continue;
        }
        if let Some(v) = tokens[i].strip_prefix("tenant_id=") {
            return Some(v.to_string());
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_scram_name() {
        assert_eq!(escape_scram_name("user"), "user");
        assert_eq!(escape_scram_name("a=b,c"), "a=3Db=2Cc");
    }

    #[test]
    fn test_split_tenant_prefix() {
        assert_eq!(split_tenant_prefix("acme__alice"), Some(("acme", "alice")));
        assert_eq!(split_tenant_prefix("acme..alice"), Some(("acme", "alice")));
        assert_eq!(split_tenant_prefix("noseparator"), None);
        assert_eq!(split_tenant_prefix("__alice"), None);
    }

    #[test]
    fn test_options_tenant_id() {
        assert_eq!(tenant_id_from_options("-c tenant_id=acme"), Some("acme".to_string()));
        assert_eq!(tenant_id_from_options("tenant_id=acme"), Some("acme".to_string()));
        assert_eq!(tenant_id_from_options("-c search_path=foo -c tenant_id=acme"), Some("acme".to_string()));
        assert_eq!(tenant_id_from_options("-c search_path=foo"), None);
    }

    #[test]
    fn test_split_options_tokens_escape() {
        let tokens = split_options_tokens(r"-c tenant_id=acme\ corp");
        assert_eq!(tokens, vec!["-c".to_string(), "tenant_id=acme corp".to_string()]);
    }
}
