//! Metadata utilities: AVU set arithmetic and well-known attributes.

use std::collections::HashSet;

use chrono::{SecondsFormat, Utc};

use crate::item::{Avu, sort_avus};

/// The iRODS attribute under which data object checksums are recorded.
pub const CHECKSUM_ATTR: &str = "md5";

/// Dublin Core metadata terms.
///
/// See <https://www.dublincore.org/resources/userguide/publishing_metadata/>
pub mod dcterms {
    pub const NAMESPACE: &str = "dcterms";

    pub const CONTRIBUTOR: &str = "dcterms:contributor";
    pub const COVERAGE: &str = "dcterms:coverage";
    pub const CREATED: &str = "dcterms:created";
    pub const CREATOR: &str = "dcterms:creator";
    pub const DATE: &str = "dcterms:date";
    pub const DESCRIPTION: &str = "dcterms:description";
    pub const FORMAT: &str = "dcterms:format";
    pub const IDENTIFIER: &str = "dcterms:identifier";
    pub const LANGUAGE: &str = "dcterms:language";
    pub const MODIFIED: &str = "dcterms:modified";
    pub const PUBLISHER: &str = "dcterms:publisher";
    pub const RELATION: &str = "dcterms:relation";
    pub const RIGHTS: &str = "dcterms:rights";
    pub const SOURCE: &str = "dcterms:source";
    pub const SUBJECT: &str = "dcterms:subject";
    pub const TITLE: &str = "dcterms:title";
    pub const TYPE: &str = "dcterms:type";
}

/// Identifies the organisation publishing data, for creation metadata.
///
/// The values are site-specific and must be supplied by the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreationMetadataConfig {
    /// URI identifying the creator organisation.
    pub creator: String,
    /// URI identifying the publisher, e.g. a directory service entry for
    /// the operator.
    pub publisher: String,
}

/// Build the standard creation metadata for a newly published data
/// object: creation time, creator, publisher and checksum AVUs.
pub fn make_creation_metadata(config: &CreationMetadataConfig, checksum: &str) -> Vec<Avu> {
    let when = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    vec![
        Avu::new(dcterms::CREATED, when),
        Avu::new(dcterms::CREATOR, &config.creator),
        Avu::new(dcterms::PUBLISHER, &config.publisher),
        Avu::new(CHECKSUM_ATTR, checksum),
    ]
}

/// Returns true if the AVU is present in the slice.
pub fn search_avu(avu: &Avu, avus: &[Avu]) -> bool {
    avus.iter().any(|a| a == avu)
}

/// Returns the AVUs matching a predicate.
pub fn filter_avus(avus: &[Avu], f: impl Fn(&Avu) -> bool) -> Vec<Avu> {
    avus.iter().filter(|avu| f(avu)).cloned().collect()
}

/// Returns a sorted slice of AVUs containing the intersection of the two
/// arguments.
pub fn set_intersect_avus(x: &[Avu], y: &[Avu]) -> Vec<Avu> {
    let mx: HashSet<&Avu> = x.iter().collect();

    let mut intersection: Vec<Avu> = y.iter().filter(|avu| mx.contains(avu)).cloned().collect();

    sort_avus(&mut intersection);
    intersection
}

/// Returns a sorted slice of AVUs containing the union of the two
/// arguments, without duplicates.
pub fn set_union_avus(x: &[Avu], y: &[Avu]) -> Vec<Avu> {
    let mut seen: HashSet<&Avu> = HashSet::new();

    let mut union: Vec<Avu> = Vec::new();
    for avu in x.iter().chain(y.iter()) {
        if seen.insert(avu) {
            union.push(avu.clone());
        }
    }

    sort_avus(&mut union);
    union
}

/// Returns a sorted slice of AVUs containing the set difference between
/// the x and y arguments.
pub fn set_diff_avus(x: &[Avu], y: &[Avu]) -> Vec<Avu> {
    let my: HashSet<&Avu> = y.iter().collect();

    let mut diff: Vec<Avu> = x.iter().filter(|avu| !my.contains(avu)).cloned().collect();

    sort_avus(&mut diff);
    diff
}

/// Returns a newly allocated, sorted slice of AVUs containing no
/// duplicates.
pub fn uniq_avus(avus: &[Avu]) -> Vec<Avu> {
    set_union_avus(avus, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avu(attr: &str, value: &str) -> Avu {
        Avu::new(attr, value)
    }

    #[test]
    fn test_search_avu() {
        let avus = vec![avu("a", "1"), avu("b", "2")];
        assert!(search_avu(&avu("a", "1"), &avus));
        assert!(!search_avu(&avu("a", "2"), &avus));
    }

    #[test]
    fn test_filter_avus() {
        let avus = vec![avu("a", "1"), avu("b", "2"), avu("a", "3")];
        let matched = filter_avus(&avus, |avu| avu.attribute == "a");
        assert_eq!(matched, vec![avu("a", "1"), avu("a", "3")]);
    }

    #[test]
    fn test_set_intersect_avus() {
        let x = vec![avu("a", "1"), avu("b", "2"), avu("c", "3")];
        let y = vec![avu("c", "3"), avu("a", "1"), avu("d", "4")];
        assert_eq!(set_intersect_avus(&x, &y), vec![avu("a", "1"), avu("c", "3")]);
    }

    #[test]
    fn test_set_union_avus() {
        let x = vec![avu("b", "2"), avu("a", "1")];
        let y = vec![avu("a", "1"), avu("c", "3"), avu("c", "3")];
        assert_eq!(
            set_union_avus(&x, &y),
            vec![avu("a", "1"), avu("b", "2"), avu("c", "3")]
        );
    }

    #[test]
    fn test_set_diff_avus() {
        let x = vec![avu("a", "1"), avu("b", "2"), avu("c", "3")];
        let y = vec![avu("b", "2")];
        assert_eq!(set_diff_avus(&x, &y), vec![avu("a", "1"), avu("c", "3")]);
    }

    #[test]
    fn test_uniq_avus() {
        let avus = vec![avu("b", "2"), avu("a", "1"), avu("b", "2")];
        assert_eq!(uniq_avus(&avus), vec![avu("a", "1"), avu("b", "2")]);
    }

    #[test]
    fn test_make_creation_metadata() {
        let config = CreationMetadataConfig {
            creator: "https://example.org".to_string(),
            publisher: "ldap://directory.example.org/people?uid=someone".to_string(),
        };

        let avus = make_creation_metadata(&config, "1181c1834012245d785120e3505ed169");
        assert_eq!(avus.len(), 4);
        assert_eq!(avus[0].attribute, dcterms::CREATED);
        assert_eq!(avus[1], Avu::new(dcterms::CREATOR, "https://example.org"));
        assert_eq!(
            avus[2],
            Avu::new(
                dcterms::PUBLISHER,
                "ldap://directory.example.org/people?uid=someone"
            )
        );
        assert_eq!(
            avus[3],
            Avu::new(CHECKSUM_ATTR, "1181c1834012245d785120e3505ed169")
        );
    }
}
