//! Environment-variable substitution on raw compose text.
//!
//! Recognizes `${NAME}` and bare `$NAME` (NAME = letters/digits/underscore,
//! not starting with a digit). Substitution runs before YAML parsing so
//! values land anywhere in the document. Names the resolver declines stay
//! in the text unmodified, sigil included: unresolved references must
//! remain visibly unresolved rather than silently vanish.

/// Replace variable references using `resolver`; unresolved references
/// pass through unchanged.
pub fn substitute<F>(text: &str, mut resolver: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() {
            if bytes[i + 1] == b'{' {
                // ${NAME}
                if let Some(end) = text[i + 2..].find('}').map(|p| i + 2 + p) {
                    let name = &text[i + 2..end];
                    if is_valid_name(name) {
                        match resolver(name) {
                            Some(value) => out.push_str(&value),
                            None => out.push_str(&text[i..=end]),
                        }
                        i = end + 1;
                        continue;
                    }
                }
                // No closing brace or invalid name: literal '$'.
                out.push('$');
                i += 1;
                continue;
            }

            if is_name_start(bytes[i + 1]) {
                // $NAME
                let mut end = i + 1;
                while end < bytes.len() && is_name_char(bytes[end]) {
                    end += 1;
                }
                let name = &text[i + 1..end];
                match resolver(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('$');
                        out.push_str(name);
                    }
                }
                i = end;
                continue;
            }
        }

        let ch = text[i..].chars().next().expect("in-bounds char boundary");
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

/// All variable names referenced in the text, in first-reference order,
/// deduplicated. Used to pre-resolve names against the secret store before
/// the (synchronous) substitution pass.
pub fn scan_variables(text: &str) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    substitute(text, |name| {
        if !seen.iter().any(|n| n == name) {
            seen.push(name.to_string());
        }
        None
    });
    seen
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && is_name_start(bytes[0])
        && bytes.iter().all(|&b| is_name_char(b))
}
