//! Text preparation for the full-text index.
//!
//! Two jobs: segment CJK codepoint runs into single-character tokens (the
//! unicode61 tokenizer treats an unsegmented run as one giant token, so
//! substring queries like 知識管理 against 知識管理系統 would match
//! nothing), and turn raw user queries into safe FTS5 MATCH expressions.

/// Maximum output length for FTS preparation.
/// CJK segmentation roughly doubles the input; cap it so pathological
/// documents cannot exhaust memory.
const MAX_FTS_OUTPUT_LEN: usize = 65536;

/// Whether a codepoint belongs to the CJK ranges we segment.
///
/// Covers the CJK Unified Ideograph blocks (base + extension A +
/// compatibility), Hiragana/Katakana, and Hangul syllables.
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'     // CJK Unified Ideographs
        | '\u{3400}'..='\u{4DBF}'   // Extension A
        | '\u{F900}'..='\u{FAFF}'   // Compatibility Ideographs
        | '\u{3040}'..='\u{309F}'   // Hiragana
        | '\u{30A0}'..='\u{30FF}'   // Katakana
        | '\u{AC00}'..='\u{D7AF}'   // Hangul Syllables
    )
}

/// Segment CJK runs into single-character tokens separated by spaces.
///
/// Non-CJK text passes through untouched, so mixed-script input stays
/// searchable both ways: `"vector 檢索"` becomes `"vector 檢 索"`.
pub(crate) fn segment_cjk(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_cjk = false;
    for c in text.chars() {
        if out.len() >= MAX_FTS_OUTPUT_LEN {
            break;
        }
        let cjk = is_cjk(c);
        if cjk && prev_cjk {
            out.push(' ');
        }
        out.push(c);
        prev_cjk = cjk;
    }
    out
}

/// Whether a query is empty or consists only of wildcard characters.
///
/// Such queries bypass MATCH entirely and return rows in insertion order.
pub(crate) fn is_wildcard_only(query: &str) -> bool {
    query.trim().chars().all(|c| c == '*' || c.is_whitespace())
}

/// Build a safe FTS5 MATCH expression from a raw user query.
///
/// Rules:
/// - Hyphenated tokens `A-B` become quoted phrases `"A-B"` so the hyphen is
///   never parsed as FTS5's NOT operator (unicode61 still splits the phrase
///   into adjacent tokens, which is the intended match).
/// - Every other token is double-quoted after stripping embedded quotes,
///   neutralizing the `OR`/`AND`/`NOT`/`NEAR` operators, parentheses, and
///   column-filter syntax.
/// - With CJK enabled the query is segmented first, so a CJK run matches
///   the single-character tokens written at index time.
///
/// Returns an empty string when nothing queryable remains; callers treat
/// that like a wildcard query.
pub(crate) fn build_match_query(query: &str, cjk: bool) -> String {
    let prepared = if cjk {
        segment_cjk(query)
    } else {
        query.to_string()
    };

    let mut terms: Vec<String> = Vec::new();
    for raw in prepared.split_whitespace() {
        let token: String = raw.chars().filter(|c| *c != '"' && *c != '*').collect();
        let trimmed = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '_');
        if trimmed.is_empty() || trimmed.chars().all(|c| c == '-' || c == '_') {
            continue;
        }
        terms.push(format!("\"{}\"", trimmed));
    }
    terms.join(" ")
}
