//! Redis-compatible glob matching
//!
//! The fallback store answers `keys(pattern)` and pattern deletes locally, so
//! it has to agree with the server on what a pattern means: `*`, `?`,
//! `[abc]`, `[^abc]`, `[a-z]` and backslash escapes.

/// Check whether `text` matches the glob `pattern`.
pub fn matches(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    // (pattern index after the last `*`, text index that star currently covers up to)
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        let next = if pi < p.len() {
            match p[pi] {
                '*' => {
                    backtrack = Some((pi + 1, ti));
                    pi += 1;
                    continue;
                }
                '?' => Some(pi + 1),
                '[' => match class_end(&p, pi) {
                    Some(end) => class_matches(&p[pi + 1..end], t[ti]).then_some(end + 1),
                    // Unterminated class: treat `[` literally
                    None => (t[ti] == '[').then_some(pi + 1),
                },
                '\\' if pi + 1 < p.len() => (p[pi + 1] == t[ti]).then_some(pi + 2),
                c => (c == t[ti]).then_some(pi + 1),
            }
        } else {
            None
        };

        match (next, backtrack) {
            (Some(np), _) => {
                pi = np;
                ti += 1;
            }
            (None, Some((star_pi, star_ti))) => {
                pi = star_pi;
                ti = star_ti + 1;
                backtrack = Some((star_pi, star_ti + 1));
            }
            (None, None) => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Escape glob metacharacters so `value` only matches itself.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Index of the `]` closing the class opened at `start`.
fn class_end(p: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < p.len() {
        match p[i] {
            '\\' => i += 2,
            ']' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn class_matches(body: &[char], c: char) -> bool {
    let (negated, body) = match body.first() {
        Some('^') => (true, &body[1..]),
        _ => (false, body),
    };

    let mut found = false;
    let mut i = 0;
    while i < body.len() {
        if body[i] == '\\' && i + 1 < body.len() {
            found |= body[i + 1] == c;
            i += 2;
        } else if i + 2 < body.len() && body[i + 1] == '-' {
            let (lo, hi) = if body[i] <= body[i + 2] {
                (body[i], body[i + 2])
            } else {
                (body[i + 2], body[i])
            };
            found |= lo <= c && c <= hi;
            i += 3;
        } else {
            found |= body[i] == c;
            i += 1;
        }
    }

    found != negated
}
