//! Identifier extraction and correlation.
//!
//! [`CorrelationEngine`] is stateless: extraction is a pure function of the
//! collector outputs in a result, and correlation is a pure function of an
//! identifier list. Both sort before they pair or select, so the outcome never
//! depends on the order in which concurrent collectors finished.
//!
//! Extraction looks at collector output two ways:
//! - **structured**: string values under well-known keys (`email`, `username`,
//!   `phone`, `domain`, ...) are taken as that kind after validation
//! - **free text**: every string is scanned for email addresses, URL hosts and
//!   international phone numbers

use crate::model::{
    CorrelationEdge, Identifier, IdentifierKey, IdentifierKind, InvestigationResult, Provenance,
    Relation,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// Confidence for a validated value found under a well-known key.
pub const STRUCTURED_CONFIDENCE: f64 = 0.9;

/// Confidence for a value pattern-matched out of free text.
pub const TEXT_CONFIDENCE: f64 = 0.6;

/// Confidence for the investigation target itself when it seeds fan-out.
pub const SEED_CONFIDENCE: f64 = 1.0;

lazy_static! {
    static ref EMAIL_IN_TEXT: Regex =
        Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").expect("email pattern");
    static ref EMAIL_EXACT: Regex =
        Regex::new(r"(?i)^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").expect("email pattern");
    static ref DOMAIN_EXACT: Regex = Regex::new(
        r"(?i)^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*\.[a-z]{2,}$"
    )
    .expect("domain pattern");
    static ref URL_HOST: Regex =
        Regex::new(r"(?i)\b(?:https?://|www\.)([a-z0-9][a-z0-9.-]*\.[a-z]{2,})")
            .expect("url pattern");
    static ref PHONE_IN_TEXT: Regex =
        Regex::new(r"\+\d[\d\s().-]{6,18}\d").expect("phone pattern");
    static ref USERNAME_EXACT: Regex =
        Regex::new(r"^@?[A-Za-z0-9_.-]{1,64}$").expect("username pattern");
}

/// Identifier kind implied by an object key, if any.
fn hint_for_key(key: &str) -> Option<IdentifierKind> {
    match key.to_ascii_lowercase().as_str() {
        "email" | "emails" | "email_address" | "mail" => Some(IdentifierKind::Email),
        "username" | "usernames" | "handle" | "screen_name" | "login" => {
            Some(IdentifierKind::Username)
        }
        "phone" | "phones" | "phone_number" | "mobile" => Some(IdentifierKind::Phone),
        "domain" | "domains" | "host" | "hostname" => Some(IdentifierKind::Domain),
        _ => None,
    }
}

fn is_valid(kind: IdentifierKind, raw: &str) -> bool {
    let raw = raw.trim();
    match kind {
        IdentifierKind::Email => EMAIL_EXACT.is_match(raw),
        IdentifierKind::Domain => DOMAIN_EXACT.is_match(raw.trim_end_matches('.')),
        IdentifierKind::Username => USERNAME_EXACT.is_match(raw),
        IdentifierKind::Phone => {
            let digits = raw.chars().filter(|c| c.is_ascii_digit()).count();
            (7..=15).contains(&digits)
        }
    }
}

// ============================================================================
// Identifier sets
// ============================================================================

/// Identifiers deduplicated by `(kind, value)`, iterated in sorted order.
#[derive(Debug, Clone, Default)]
pub struct IdentifierSet {
    by_key: BTreeMap<IdentifierKey, Identifier>,
}

impl IdentifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an identifier, merging provenance if it is already present.
    pub fn insert(&mut self, identifier: Identifier) {
        match self.by_key.entry(identifier.key()) {
            Entry::Occupied(mut existing) => existing.get_mut().merge(identifier),
            Entry::Vacant(slot) => {
                slot.insert(identifier);
            }
        }
    }

    pub fn merge(&mut self, other: IdentifierSet) {
        self.extend(other.by_key.into_values());
    }

    pub fn get(&self, key: &IdentifierKey) -> Option<&Identifier> {
        self.by_key.get(key)
    }

    pub fn contains(&self, key: &IdentifierKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identifier> {
        self.by_key.values()
    }

    /// Identifiers grouped by kind.
    pub fn by_kind(&self) -> BTreeMap<IdentifierKind, Vec<Identifier>> {
        let mut grouped: BTreeMap<IdentifierKind, Vec<Identifier>> = BTreeMap::new();
        for identifier in self.iter() {
            grouped.entry(identifier.kind).or_default().push(identifier.clone());
        }
        grouped
    }

    /// At most `per_kind` identifiers of each kind, most confident first
    /// (ties broken by value), in kind order.
    pub fn select_for_fan_out(&self, per_kind: usize) -> Vec<Identifier> {
        self.by_kind()
            .into_values()
            .flat_map(|mut group| {
                group.sort_by(|a, b| {
                    b.confidence
                        .total_cmp(&a.confidence)
                        .then_with(|| a.value.cmp(&b.value))
                });
                group.truncate(per_kind);
                group
            })
            .collect()
    }

    pub fn into_vec(self) -> Vec<Identifier> {
        self.by_key.into_values().collect()
    }
}

impl Extend<Identifier> for IdentifierSet {
    fn extend<T: IntoIterator<Item = Identifier>>(&mut self, iter: T) {
        for identifier in iter {
            self.insert(identifier);
        }
    }
}

impl FromIterator<Identifier> for IdentifierSet {
    fn from_iter<T: IntoIterator<Item = Identifier>>(iter: T) -> Self {
        let mut set = IdentifierSet::new();
        set.extend(iter);
        set
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationEngine;

impl CorrelationEngine {
    pub fn new() -> Self {
        Self
    }

    /// Extracts identifiers from every successful collector output in `result`.
    pub fn extract_identifiers(&self, result: &InvestigationResult) -> IdentifierSet {
        let mut set = IdentifierSet::new();
        for (source, data) in result.collector_outputs() {
            set.merge(self.extract_from_value(data, &source));
        }
        set
    }

    /// Extracts identifiers from a single collector output.
    pub fn extract_from_value(&self, value: &Value, source: &Provenance) -> IdentifierSet {
        let mut set = IdentifierSet::new();
        walk(value, None, source, &mut set);
        set
    }

    /// Builds the correlation graph for an identifier list.
    ///
    /// Two identifiers are linked when they came out of the same collector
    /// call; the edge's corroboration is the number of distinct collectors in
    /// which they co-occurred. An email and a domain identifier that share a
    /// domain are linked as well, if not already co-occurring. Duplicates in
    /// the input are merged first, and the output is sorted, so any
    /// permutation of the same input yields the same edges.
    pub fn correlate(&self, identifiers: &[Identifier]) -> Vec<CorrelationEdge> {
        let set: IdentifierSet = identifiers.iter().cloned().collect();

        let mut calls: BTreeMap<&Provenance, Vec<&Identifier>> = BTreeMap::new();
        for identifier in set.iter() {
            for source in &identifier.sources {
                calls.entry(source).or_default().push(identifier);
            }
        }

        let mut pairs: BTreeMap<(IdentifierKey, IdentifierKey), BTreeSet<&str>> = BTreeMap::new();
        for (call, members) in &calls {
            for (i, a) in members.iter().enumerate() {
                for b in &members[i + 1..] {
                    pairs
                        .entry((a.key(), b.key()))
                        .or_default()
                        .insert(call.module.as_str());
                }
            }
        }

        let confidence_of = |key: &IdentifierKey| set.get(key).map_or(0.0, |i| i.confidence);

        let mut edges: BTreeMap<(IdentifierKey, IdentifierKey), CorrelationEdge> = BTreeMap::new();
        for ((a, b), modules) in pairs {
            let confidence = edge_confidence(confidence_of(&a), confidence_of(&b), modules.len());
            edges.insert(
                (a.clone(), b.clone()),
                CorrelationEdge {
                    a,
                    b,
                    relation: Relation::CoOccurrence,
                    corroboration: modules.len(),
                    confidence,
                },
            );
        }

        for email in set.iter().filter(|i| i.kind == IdentifierKind::Email) {
            let Some((_, domain)) = email.value.rsplit_once('@') else {
                continue;
            };
            let domain_key = IdentifierKey {
                kind: IdentifierKind::Domain,
                value: domain.to_string(),
            };
            let Some(domain_identifier) = set.get(&domain_key) else {
                continue;
            };
            let pair = ordered(email.key(), domain_key);
            if edges.contains_key(&pair) {
                continue;
            }
            let modules: BTreeSet<&str> = email
                .modules()
                .union(&domain_identifier.modules())
                .copied()
                .collect();
            let confidence =
                edge_confidence(email.confidence, domain_identifier.confidence, modules.len());
            edges.insert(
                pair.clone(),
                CorrelationEdge {
                    a: pair.0,
                    b: pair.1,
                    relation: Relation::SharedDomain,
                    corroboration: modules.len(),
                    confidence,
                },
            );
        }

        edges.into_values().collect()
    }
}

fn ordered(x: IdentifierKey, y: IdentifierKey) -> (IdentifierKey, IdentifierKey) {
    if x <= y {
        (x, y)
    } else {
        (y, x)
    }
}

/// Weaker endpoint's confidence, scaled up towards it by each corroborating collector.
fn edge_confidence(a: f64, b: f64, corroboration: usize) -> f64 {
    let exponent = i32::try_from(corroboration).unwrap_or(i32::MAX);
    a.min(b) * (1.0 - 0.5f64.powi(exponent))
}

fn walk(value: &Value, hint: Option<IdentifierKind>, source: &Provenance, out: &mut IdentifierSet) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                walk(child, hint_for_key(key), source, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, hint, source, out);
            }
        }
        Value::String(text) => {
            if let Some(kind) = hint {
                if is_valid(kind, text) {
                    out.extend(Identifier::new(kind, text, STRUCTURED_CONFIDENCE, source.clone()));
                }
            }
            scan_text(text, source, out);
        }
        Value::Number(number) if hint == Some(IdentifierKind::Phone) => {
            let text = number.to_string();
            if is_valid(IdentifierKind::Phone, &text) {
                out.extend(Identifier::new(
                    IdentifierKind::Phone,
                    &text,
                    STRUCTURED_CONFIDENCE,
                    source.clone(),
                ));
            }
        }
        _ => {}
    }
}

fn scan_text(text: &str, source: &Provenance, out: &mut IdentifierSet) {
    for found in EMAIL_IN_TEXT.find_iter(text) {
        out.extend(Identifier::new(
            IdentifierKind::Email,
            found.as_str(),
            TEXT_CONFIDENCE,
            source.clone(),
        ));
    }
    for captures in URL_HOST.captures_iter(text) {
        if let Some(host) = captures.get(1) {
            if is_valid(IdentifierKind::Domain, host.as_str()) {
                out.extend(Identifier::new(
                    IdentifierKind::Domain,
                    host.as_str(),
                    TEXT_CONFIDENCE,
                    source.clone(),
                ));
            }
        }
    }
    for found in PHONE_IN_TEXT.find_iter(text) {
        if is_valid(IdentifierKind::Phone, found.as_str()) {
            out.extend(Identifier::new(
                IdentifierKind::Phone,
                found.as_str(),
                TEXT_CONFIDENCE,
                source.clone(),
            ));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        CrossPlatformEntry, InvestigationId, InvestigationRequest, ModuleOutcome, TargetKind,
    };
    use proptest::prelude::*;
    use serde_json::json;

    fn id(kind: IdentifierKind, value: &str, module: &str, call: &str, confidence: f64) -> Identifier {
        let source = Provenance {
            module: module.to_string(),
            call: call.to_string(),
        };
        Identifier::new(kind, value, confidence, source).unwrap()
    }

    fn key(kind: IdentifierKind, value: &str) -> IdentifierKey {
        IdentifierKey {
            kind,
            value: value.to_string(),
        }
    }

    #[test]
    fn test_structured_extraction() {
        let engine = CorrelationEngine::new();
        let set = engine.extract_from_value(
            &json!({"username": "foo", "domain": "b.com"}),
            &Provenance::direct("email"),
        );

        let keys: Vec<_> = set.iter().map(Identifier::key).collect();
        assert_eq!(
            keys,
            vec![key(IdentifierKind::Username, "foo"), key(IdentifierKind::Domain, "b.com")]
        );
        assert!(set.iter().all(|i| i.confidence == STRUCTURED_CONFIDENCE));
    }

    #[test]
    fn test_free_text_extraction() {
        let engine = CorrelationEngine::new();
        let set = engine.extract_from_value(
            &json!({
                "bio": "Contact me at Jane.Doe@Example.org or +1 (555) 010-9999",
                "links": ["https://www.janedoe.dev/about", "not a url"],
                "followers": 1200,
            }),
            &Provenance::direct("twitter"),
        );

        assert!(set.contains(&key(IdentifierKind::Email, "jane.doe@example.org")));
        assert!(set.contains(&key(IdentifierKind::Domain, "janedoe.dev")));
        assert!(set.contains(&key(IdentifierKind::Phone, "+15550109999")));
        assert_eq!(set.len(), 3);
        assert!(set.iter().all(|i| i.confidence == TEXT_CONFIDENCE));
    }

    #[test]
    fn test_invalid_structured_values_are_ignored() {
        let engine = CorrelationEngine::new();
        let set = engine.extract_from_value(
            &json!({"email": "not-an-email", "username": "has spaces here", "phone": "12"}),
            &Provenance::direct("x"),
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_extraction_merges_provenance_across_modules() {
        let request = InvestigationRequest::new(TargetKind::Email, "a@b.com", 2).unwrap();
        let mut result = InvestigationResult::new(InvestigationId::new(), request);
        result.per_module_results.insert(
            "email".into(),
            ModuleOutcome::Success { data: json!({"username": "Foo"}), elapsed_ms: 1 },
        );
        result.cross_platform_results.push(CrossPlatformEntry {
            module: "github".into(),
            identifier: key(IdentifierKind::Username, "foo"),
            outcome: ModuleOutcome::Success { data: json!({"login": "@foo"}), elapsed_ms: 1 },
        });
        result.cross_platform_results.push(CrossPlatformEntry {
            module: "twitter".into(),
            identifier: key(IdentifierKind::Username, "foo"),
            outcome: ModuleOutcome::Failure { error: "403".into() },
        });

        let set = CorrelationEngine::new().extract_identifiers(&result);
        assert_eq!(set.len(), 1);
        let foo = set.iter().next().unwrap();
        assert_eq!(foo.modules().into_iter().collect::<Vec<_>>(), vec!["email", "github"]);
        assert_eq!(set.by_kind()[&IdentifierKind::Username].len(), 1);
    }

    #[test]
    fn test_select_for_fan_out_caps_each_kind() {
        let mut set = IdentifierSet::new();
        for i in 0..8 {
            set.insert(id(IdentifierKind::Username, &format!("user{}", i), "m", "direct", 0.5));
        }
        set.insert(id(IdentifierKind::Username, "zz_top", "m", "direct", 0.95));
        set.insert(id(IdentifierKind::Domain, "b.com", "m", "direct", 0.9));

        let selected = set.select_for_fan_out(5);
        let usernames: Vec<_> = selected
            .iter()
            .filter(|i| i.kind == IdentifierKind::Username)
            .map(|i| i.value.as_str())
            .collect();
        assert_eq!(usernames, vec!["zz_top", "user0", "user1", "user2", "user3"]);
        assert_eq!(selected.len(), 6);
    }

    #[test]
    fn test_co_occurrence_edges_and_corroboration() {
        let engine = CorrelationEngine::new();
        let identifiers = vec![
            id(IdentifierKind::Username, "foo", "email", "direct", 0.9),
            id(IdentifierKind::Domain, "b.com", "email", "direct", 0.9),
            id(IdentifierKind::Username, "foo", "github", "username:foo", 0.9),
            id(IdentifierKind::Domain, "b.com", "github", "username:foo", 0.6),
            id(IdentifierKind::Phone, "+33612345678", "phone", "direct", 0.9),
        ];

        let edges = engine.correlate(&identifiers);
        assert_eq!(edges.len(), 1);
        let edge = &edges[0];
        assert_eq!(edge.a, key(IdentifierKind::Username, "foo"));
        assert_eq!(edge.b, key(IdentifierKind::Domain, "b.com"));
        assert_eq!(edge.relation, Relation::CoOccurrence);
        assert_eq!(edge.corroboration, 2);
        assert!((edge.confidence - 0.9 * 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_shared_domain_edge() {
        let engine = CorrelationEngine::new();
        let identifiers = vec![
            id(IdentifierKind::Email, "a@b.com", "breach", "direct", 0.9),
            id(IdentifierKind::Domain, "b.com", "whois", "direct", 0.9),
        ];

        let edges = engine.correlate(&identifiers);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relation, Relation::SharedDomain);
        assert_eq!(edges[0].corroboration, 2);
    }

    #[test]
    fn test_correlate_is_idempotent() {
        let engine = CorrelationEngine::new();
        let identifiers = sample_identifiers();
        assert_eq!(engine.correlate(&identifiers), engine.correlate(&identifiers));
    }

    fn sample_identifiers() -> Vec<Identifier> {
        vec![
            id(IdentifierKind::Username, "foo", "email", "direct", 0.9),
            id(IdentifierKind::Domain, "b.com", "email", "direct", 0.9),
            id(IdentifierKind::Email, "a@b.com", "email", "direct", 0.6),
            id(IdentifierKind::Username, "foo", "github", "username:foo", 0.7),
            id(IdentifierKind::Email, "foo@mail.net", "github", "username:foo", 0.6),
            id(IdentifierKind::Phone, "+33612345678", "github", "username:foo", 0.6),
            id(IdentifierKind::Domain, "mail.net", "whois", "domain:b.com", 0.9),
            id(IdentifierKind::Domain, "b.com", "whois", "domain:b.com", 0.9),
            id(IdentifierKind::Username, "bar", "twitter", "username:foo", 0.5),
            id(IdentifierKind::Username, "foo", "twitter", "username:foo", 0.9),
        ]
    }

    proptest! {
        #[test]
        fn prop_correlate_is_order_independent(
            shuffled in Just(sample_identifiers()).prop_shuffle()
        ) {
            let engine = CorrelationEngine::new();
            let baseline = serde_json::to_string(&engine.correlate(&sample_identifiers())).unwrap();
            let edges = serde_json::to_string(&engine.correlate(&shuffled)).unwrap();
            prop_assert_eq!(baseline, edges);
        }
    }
}
