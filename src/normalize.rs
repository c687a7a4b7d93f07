//! Surface-string normalization for entity resolution.
//!
//! All observed restaurant/dish/attribute strings are normalized before any
//! store lookup so that "The Brisket", "brisket " and "BRISKET" group to the
//! same key within a batch and across batches.

/// Normalize a surface string: lowercase, trim, collapse internal whitespace,
/// strip a single leading article.
pub fn normalize(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let collapsed: Vec<&str> = lowered.split_whitespace().collect();
    let stripped: &[&str] = match collapsed.first() {
        Some(&"the") | Some(&"a") | Some(&"an") if collapsed.len() > 1 => &collapsed[1..],
        _ => &collapsed[..],
    };
    stripped.join(" ")
}

/// Whitespace tokens of an already-normalized string.
pub fn tokens(normalized: &str) -> Vec<&str> {
    normalized.split_whitespace().collect()
}

/// True when every token of `inner` appears in `outer` (or vice versa).
/// Used as the deterministic heuristic in the mid-confidence gating band:
/// "franklin bbq" vs "franklin barbecue bbq" merges, "franklin bbq" vs
/// "frankie bbq" does not.
pub fn token_superset(a: &str, b: &str) -> bool {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return false;
    }
    let (small, big) = if ta.len() <= tb.len() { (&ta, &tb) } else { (&tb, &ta) };
    small.iter().all(|t| big.contains(t))
}
