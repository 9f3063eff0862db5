//! Wildcard search patterns.
//!
//! Keywords become SQL `LIKE`-style patterns: `%` matches any run of
//! characters, `_` matches one, and `\` escapes either. Each keyword is
//! escaped on its own and its internal whitespace becomes a `%` gap, so
//! `"space opera"` matches "space opera" and "space-faring opera" alike.

/// Patterns shorter than this are dropped (`"%%"` would match everything).
pub const MIN_PATTERN_LEN: usize = 3;

/// Escape `%`, `_` and `\` so they match literally.
pub fn escape_like_term(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `%<escaped words joined by %>%`, or an empty string for an empty keyword.
pub fn build_wildcard_pattern(keyword: &str) -> String {
    let words: Vec<String> = keyword.split_whitespace().map(escape_like_term).collect();
    if words.is_empty() {
        return String::new();
    }
    format!("%{}%", words.join("%"))
}

pub fn build_search_patterns<S: AsRef<str>>(keywords: &[S]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| build_wildcard_pattern(k.as_ref()))
        .filter(|p| p.chars().count() >= MIN_PATTERN_LEN)
        .collect()
}

#[derive(Debug, PartialEq)]
enum Token {
    Literal(char),
    One,
    Many,
}

fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '\\' => Token::Literal(chars.next().unwrap_or('\\')),
            '%' => Token::Many,
            '_' => Token::One,
            c => Token::Literal(c),
        });
    }
    tokens
}

/// Case-insensitive `LIKE` match of the whole `text` against `pattern`.
pub fn like_matches(pattern: &str, text: &str) -> bool {
    let pattern = tokenize(&pattern.to_lowercase());
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut pi, mut ti) = (0, 0);
    // Last `%` seen and the text position it is currently absorbing up to.
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < text.len() {
        match pattern.get(pi) {
            Some(Token::Many) => {
                backtrack = Some((pi, ti));
                pi += 1;
                continue;
            }
            Some(Token::One) => {
                pi += 1;
                ti += 1;
                continue;
            }
            Some(Token::Literal(c)) if *c == text[ti] => {
                pi += 1;
                ti += 1;
                continue;
            }
            _ => {}
        }
        match backtrack {
            Some((star, absorbed)) => {
                pi = star + 1;
                ti = absorbed + 1;
                backtrack = Some((star, absorbed + 1));
            }
            None => return false,
        }
    }

    pattern[pi..].iter().all(|t| *t == Token::Many)
}
