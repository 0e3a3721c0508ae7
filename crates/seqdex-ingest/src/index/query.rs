//! Identifier analysis and query normalization
//!
//! Both sides of a lookup go through the same rules: tokens are split on
//! whitespace and `|`, lower-cased, and versioned accessions (`NP_000001.1`)
//! are also indexed without their version. Database origin tags such as
//! `gi`, `ref` or `sp` carry no identity and are dropped.

/// Origin tags of NCBI-style composite identifiers
const ORIGIN_TAGS: &[&str] = &[
    "gi", "gb", "emb", "dbj", "ref", "sp", "tr", "pir", "prf", "pdb", "gnl", "lcl", "bbs", "bbm",
    "gim", "pat", "tpg", "tpe", "tpd",
];

fn is_origin_tag(token: &str) -> bool {
    ORIGIN_TAGS.contains(&token)
}

fn tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c == '|' || c.is_whitespace())
        .filter(|t| !t.is_empty())
}

/// `NP_000001.1` -> `NP_000001`, for tokens ending in `.<digits>`
fn unversioned(token: &str) -> Option<&str> {
    let (head, version) = token.rsplit_once('.')?;
    if head.is_empty() || version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(head)
}

/// Index terms for an entry
pub fn analyze(id: &str, name: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    let mut push = |term: String| {
        if !terms.contains(&term) {
            terms.push(term);
        }
    };

    for token in tokens(id).chain(tokens(name)) {
        let lower = token.to_lowercase();
        if is_origin_tag(&lower) {
            continue;
        }
        if let Some(head) = unversioned(&lower) {
            push(head.to_string());
        }
        push(lower);
    }
    terms
}

/// Terms to look up for a user query
///
/// Composite identifiers like `gi|123|ref|NP_000001.1|` contribute every
/// non-tag token. The token after `gnl` names a sub-database and is skipped;
/// the token after `pdb` is the molecule id and ends the scan, since the
/// chain identifier that follows is not part of the entry identity. A query
/// that yields no token is looked up as-is.
pub fn query_terms(query: &str) -> Vec<String> {
    let parts: Vec<&str> = tokens(query).collect();
    let mut terms = Vec::new();
    let mut i = 0;

    while i < parts.len() {
        let lower = parts[i].to_lowercase();
        match lower.as_str() {
            "gnl" => i += 2,
            "pdb" => {
                if let Some(molecule) = parts.get(i + 1) {
                    terms.push(molecule.to_lowercase());
                }
                break;
            }
            tag if is_origin_tag(tag) => i += 1,
            _ => {
                terms.push(lower);
                i += 1;
            }
        }
    }

    if terms.is_empty() {
        let raw = query.trim().to_lowercase();
        if !raw.is_empty() {
            terms.push(raw);
        }
    }
    terms.dedup();
    terms
}
