//! Task slug generation.

const MAX_SLUG_LEN: usize = 50;

/// Derive a URL-safe slug from a task title.
///
/// Lowercases, drops everything outside `[a-z0-9 _-]`, turns whitespace and
/// underscores into `-`, collapses runs of `-`, and trims to 50 characters.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.to_lowercase().chars() {
        let mapped = match c {
            'a'..='z' | '0'..='9' => Some(c),
            '-' | '_' => Some('-'),
            c if c.is_whitespace() => Some('-'),
            _ => None,
        };
        if let Some(m) = mapped {
            if m == '-' && (slug.is_empty() || slug.ends_with('-')) {
                continue;
            }
            slug.push(m);
        }
    }

    slug.truncate(MAX_SLUG_LEN);
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `base`, or `base-N` for the first N >= 2 that `taken` rejects.
pub fn disambiguate(base: &str, mut taken: impl FnMut(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (2u32..)
        .map(|n| format!("{base}-{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}
