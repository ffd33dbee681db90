//! Canonicalization of marketplace resource paths.
//!
//! Notifications about one item arrive under several path variants; the
//! competitive-pricing view (`/items/MLA…/price_to_win`) refers to the same
//! underlying item as the plain detail path. Canonicalization collapses
//! those variants into one key, and it is applied exactly once, at the
//! ingestion boundary. Everything downstream (event rows, preview cache,
//! listing joins) operates on canonical keys only.

const COMPETITION_SUFFIX: &str = "/price_to_win";

/// Derive the canonical resource key for a raw notification resource.
///
/// A competitive-pricing path loses the suffix and any query string; any
/// other resource is returned unchanged. The function is pure and
/// idempotent: `normalize(normalize(r)) == normalize(r)`.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let path = trimmed.split('?').next().unwrap_or(trimmed);
    if let Some(base) = path.strip_suffix(COMPETITION_SUFFIX)
        && !base.is_empty()
    {
        return base.to_string();
    }
    trimmed.to_string()
}

/// Whether the raw resource addressed the competitive-pricing view.
pub fn is_competitive(raw: &str) -> bool {
    let trimmed = raw.trim();
    let path = trimmed.split('?').next().unwrap_or(trimmed);
    path.len() > COMPETITION_SUFFIX.len() && path.ends_with(COMPETITION_SUFFIX)
}

/// Whether a canonical resource names a trackable item.
pub fn is_item_resource(resource: &str) -> bool {
    resource
        .strip_prefix("/items/")
        .is_some_and(|rest| !rest.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_competition_suffix() {
        assert_eq!(normalize("/items/MLA123/price_to_win"), "/items/MLA123");
    }

    #[test]
    fn strips_query_string_with_suffix() {
        assert_eq!(
            normalize("/items/MLA123/price_to_win?version=v2"),
            "/items/MLA123"
        );
    }

    #[test]
    fn plain_resource_unchanged() {
        assert_eq!(normalize("/items/MLA123"), "/items/MLA123");
        assert_eq!(normalize("/orders/456"), "/orders/456");
    }

    #[test]
    fn idempotent() {
        for raw in [
            "/items/MLA1/price_to_win",
            "/items/MLA1/price_to_win?x=1",
            "/items/MLA1",
            "/shipments/9",
        ] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn suffixed_and_plain_collapse_to_same_key() {
        assert_eq!(
            normalize("/items/MLA77/price_to_win"),
            normalize("/items/MLA77")
        );
    }

    #[test]
    fn bare_suffix_is_not_rewritten() {
        assert_eq!(normalize("/price_to_win"), "/price_to_win");
        assert!(!is_competitive("/price_to_win"));
    }

    #[test]
    fn detects_resource_kinds() {
        assert!(is_competitive("/items/MLA1/price_to_win"));
        assert!(is_competitive("/items/MLA1/price_to_win?v=2"));
        assert!(!is_competitive("/items/MLA1"));
        assert!(is_item_resource("/items/MLA1"));
        assert!(!is_item_resource("/items/"));
        assert!(!is_item_resource("/orders/123"));
    }
}
