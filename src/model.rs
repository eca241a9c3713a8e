//! Data model shared by the registry, the orchestrator and the correlation engine.
//!
//! Everything here is plain data: requests come in, [`InvestigationResult`]s
//! go out, and both serialize to JSON for reporting collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Shallowest investigation depth (direct collector only).
pub const MIN_DEPTH: u8 = 1;

/// Deepest investigation depth (direct + fan-out + enrichment).
pub const MAX_DEPTH: u8 = 3;

// ============================================================================
// Targets
// ============================================================================

/// Kind of value an investigation (or a single collector call) targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Email,
    Phone,
    Username,
    Domain,
    Ip,
    /// Cryptocurrency wallet address
    Wallet,
    Url,
}

impl TargetKind {
    pub const ALL: [TargetKind; 7] = [
        TargetKind::Email,
        TargetKind::Phone,
        TargetKind::Username,
        TargetKind::Domain,
        TargetKind::Ip,
        TargetKind::Wallet,
        TargetKind::Url,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Email => "email",
            TargetKind::Phone => "phone",
            TargetKind::Username => "username",
            TargetKind::Domain => "domain",
            TargetKind::Ip => "ip",
            TargetKind::Wallet => "wallet",
            TargetKind::Url => "url",
        }
    }

    /// The identifier kind a target of this kind seeds, if any.
    pub fn identifier_kind(&self) -> Option<IdentifierKind> {
        match self {
            TargetKind::Email => Some(IdentifierKind::Email),
            TargetKind::Phone => Some(IdentifierKind::Phone),
            TargetKind::Username => Some(IdentifierKind::Username),
            TargetKind::Domain => Some(IdentifierKind::Domain),
            TargetKind::Ip | TargetKind::Wallet | TargetKind::Url => None,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown target kind: '{0}'")]
pub struct UnknownTargetKind(pub String);

impl FromStr for TargetKind {
    type Err = UnknownTargetKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        TargetKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == needle)
            .ok_or_else(|| UnknownTargetKind(s.to_string()))
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Errors raised when a request is rejected before any tier runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Depth {0} is outside the supported range 1..=3")]
    InvalidDepth(u8),

    #[error("Target value is empty")]
    EmptyTarget,
}

/// Caller-provided knobs that do not change the tier structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationOptions {
    /// Collectors that must not be invoked in any tier
    #[serde(default)]
    pub exclude_modules: BTreeSet<String>,

    /// Whether tier 3 hands the result to enrichment collaborators
    #[serde(default = "default_true")]
    pub enrichment: bool,

    /// Opaque values passed through for front ends and collaborators
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Default for InvestigationOptions {
    fn default() -> Self {
        Self {
            exclude_modules: BTreeSet::new(),
            enrichment: true,
            extra: BTreeMap::new(),
        }
    }
}

/// A single investigation request. Created per call and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationRequest {
    pub target_kind: TargetKind,
    pub target_value: String,
    pub depth: u8,
    #[serde(default)]
    pub options: InvestigationOptions,
}

impl InvestigationRequest {
    /// Builds a validated request with default options.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] if `depth` is outside `1..=3` or `value` is blank.
    pub fn new(kind: TargetKind, value: impl Into<String>, depth: u8) -> Result<Self, RequestError> {
        let request = Self {
            target_kind: kind,
            target_value: value.into().trim().to_string(),
            depth,
            options: InvestigationOptions::default(),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_options(mut self, options: InvestigationOptions) -> Self {
        self.options = options;
        self
    }

    /// Re-checks the invariants `new` enforces; deserialized requests bypass `new`.
    pub fn validate(&self) -> Result<(), RequestError> {
        if !(MIN_DEPTH..=MAX_DEPTH).contains(&self.depth) {
            return Err(RequestError::InvalidDepth(self.depth));
        }
        if self.target_value.trim().is_empty() {
            return Err(RequestError::EmptyTarget);
        }
        Ok(())
    }

    pub fn runs_cross_platform(&self) -> bool {
        self.depth >= 2
    }

    pub fn runs_enrichment(&self) -> bool {
        self.depth >= 3
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Kinds of identifier the correlation engine extracts and fans out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Username,
    Email,
    Phone,
    Domain,
}

impl IdentifierKind {
    pub const ALL: [IdentifierKind; 4] = [
        IdentifierKind::Username,
        IdentifierKind::Email,
        IdentifierKind::Phone,
        IdentifierKind::Domain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Username => "username",
            IdentifierKind::Email => "email",
            IdentifierKind::Phone => "phone",
            IdentifierKind::Domain => "domain",
        }
    }

    /// Target kind used when this identifier is handed to another collector.
    pub fn target_kind(&self) -> TargetKind {
        match self {
            IdentifierKind::Username => TargetKind::Username,
            IdentifierKind::Email => TargetKind::Email,
            IdentifierKind::Phone => TargetKind::Phone,
            IdentifierKind::Domain => TargetKind::Domain,
        }
    }

    /// Canonical form of `raw` for this kind; empty when nothing usable remains.
    pub fn normalize(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        match self {
            IdentifierKind::Email => trimmed.to_lowercase(),
            IdentifierKind::Domain => {
                let lower = trimmed.trim_end_matches('.').to_lowercase();
                lower.strip_prefix("www.").unwrap_or(&lower).to_string()
            }
            IdentifierKind::Username => trimmed.trim_start_matches('@').to_lowercase(),
            IdentifierKind::Phone => {
                let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    String::new()
                } else if trimmed.starts_with('+') {
                    format!("+{}", digits)
                } else {
                    digits
                }
            }
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an identifier was seen: which module, and which call of that module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub module: String,

    /// `"direct"` for the tier-1 call, `"<kind>:<value>"` for a fan-out call
    pub call: String,
}

impl Provenance {
    pub const DIRECT_CALL: &'static str = "direct";

    pub fn direct(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            call: Self::DIRECT_CALL.to_string(),
        }
    }

    pub fn fan_out(module: impl Into<String>, identifier: &IdentifierKey) -> Self {
        Self {
            module: module.into(),
            call: identifier.to_string(),
        }
    }
}

/// The `(kind, value)` pair that identifies an [`Identifier`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentifierKey {
    pub kind: IdentifierKind,
    pub value: String,
}

impl fmt::Display for IdentifierKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// A typed, deduplicated piece of evidence.
///
/// Equality, hashing and ordering only look at `(kind, value)`; provenance
/// accumulates in `sources` when the same identifier is seen again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier {
    pub kind: IdentifierKind,
    pub value: String,
    pub confidence: f64,
    pub sources: BTreeSet<Provenance>,
}

impl Identifier {
    /// Normalizes `raw` and builds an identifier, or `None` if the value is empty.
    pub fn new(kind: IdentifierKind, raw: &str, confidence: f64, source: Provenance) -> Option<Self> {
        let value = kind.normalize(raw);
        if value.is_empty() {
            return None;
        }
        let mut sources = BTreeSet::new();
        sources.insert(source);
        Some(Self {
            kind,
            value,
            confidence: clamp_confidence(confidence),
            sources,
        })
    }

    pub fn key(&self) -> IdentifierKey {
        IdentifierKey {
            kind: self.kind,
            value: self.value.clone(),
        }
    }

    /// Folds another sighting of the same identifier into this one.
    ///
    /// Sightings of a different `(kind, value)` are ignored.
    pub fn merge(&mut self, other: Identifier) {
        if *self != other {
            return;
        }
        self.confidence = self.confidence.max(other.confidence);
        self.sources.extend(other.sources);
    }

    /// Distinct modules that reported this identifier.
    pub fn modules(&self) -> BTreeSet<&str> {
        self.sources.iter().map(|p| p.module.as_str()).collect()
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.value == other.value
    }
}

impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.value.hash(state);
    }
}

impl PartialOrd for Identifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identifier {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.kind, &self.value).cmp(&(other.kind, &other.value))
    }
}

// ============================================================================
// Correlation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Both identifiers came out of the same collector call
    CoOccurrence,

    /// An email address and a domain identifier share the same domain
    SharedDomain,
}

/// Undirected link between two identifiers; `a` always sorts before `b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEdge {
    pub a: IdentifierKey,
    pub b: IdentifierKey,
    pub relation: Relation,

    /// Number of distinct collectors backing this edge
    pub corroboration: usize,

    pub confidence: f64,
}

// ============================================================================
// Outcomes
// ============================================================================

/// Recorded outcome of one collector or enrichment call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModuleOutcome {
    Success { data: Value, elapsed_ms: u64 },
    Failure { error: String },
    Timeout { after_ms: u64 },
    Cancelled,
}

impl ModuleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ModuleOutcome::Success { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ModuleOutcome::Timeout { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ModuleOutcome::Success { data, .. } => Some(data),
            _ => None,
        }
    }

    /// `true` for a success carrying something other than null or an empty container.
    pub fn has_data(&self) -> bool {
        match self.data() {
            None | Some(Value::Null) => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }
}

/// Outcome of one tier-2 call: `module` investigated `identifier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossPlatformEntry {
    pub module: String,
    pub identifier: IdentifierKey,
    pub outcome: ModuleOutcome,
}

// ============================================================================
// Investigation results
// ============================================================================

/// Lifecycle of an investigation.
///
/// `Created → Tier1 → Tier2* → Tier3* → Finalizing → Completed`, with `Failed`
/// reachable from any non-terminal state on an orchestrator fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationState {
    Created,
    Tier1,
    Tier2,
    Tier3,
    Finalizing,
    Completed,
    Failed,
}

impl InvestigationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvestigationState::Completed | InvestigationState::Failed)
    }

    pub fn can_transition_to(&self, next: InvestigationState) -> bool {
        use InvestigationState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Created, Tier1)
                | (Tier1, Tier2)
                | (Tier1, Finalizing)
                | (Tier2, Tier3)
                | (Tier2, Finalizing)
                | (Tier3, Finalizing)
                | (Finalizing, Completed)
        )
    }
}

impl fmt::Display for InvestigationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvestigationState::Created => "created",
            InvestigationState::Tier1 => "tier1",
            InvestigationState::Tier2 => "tier2",
            InvestigationState::Tier3 => "tier3",
            InvestigationState::Finalizing => "finalizing",
            InvestigationState::Completed => "completed",
            InvestigationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Collision-free investigation identifier, rendered as `inv_<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InvestigationId(Uuid);

impl InvestigationId {
    const PREFIX: &'static str = "inv_";

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvestigationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvestigationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0.simple())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed investigation id: '{0}'")]
pub struct MalformedId(pub String);

impl FromStr for InvestigationId {
    type Err = MalformedId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix(Self::PREFIX)
            .and_then(|rest| Uuid::parse_str(rest).ok())
            .map(InvestigationId)
            .ok_or_else(|| MalformedId(s.to_string()))
    }
}

impl TryFrom<String> for InvestigationId {
    type Error = MalformedId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InvestigationId> for String {
    fn from(id: InvestigationId) -> Self {
        id.to_string()
    }
}

/// How much an investigation actually found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coverage {
    /// No collector was invoked at all
    NoCollectorAttempted,

    /// Collectors ran, but none returned data
    NoDataFound,

    DataFound,
}

/// Aggregate output of one investigation.
///
/// Once the orchestrator hands it out (behind an `Arc`) it is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationResult {
    pub id: InvestigationId,
    pub request: InvestigationRequest,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub state: InvestigationState,

    /// Set when the run was cut short by its cancellation token
    #[serde(default)]
    pub cancelled: bool,

    /// Tiers that actually executed, in order
    #[serde(default)]
    pub tiers_run: Vec<u8>,

    #[serde(default)]
    pub per_module_results: BTreeMap<String, ModuleOutcome>,

    /// Sorted by module, then identifier
    #[serde(default)]
    pub cross_platform_results: Vec<CrossPlatformEntry>,

    /// Sorted by `(kind, value)`
    #[serde(default)]
    pub identifiers: Vec<Identifier>,

    #[serde(default)]
    pub correlation_edges: Vec<CorrelationEdge>,

    #[serde(default)]
    pub enrichment: BTreeMap<String, ModuleOutcome>,
}

impl InvestigationResult {
    /// Empty result in the `Created` state.
    pub fn new(id: InvestigationId, request: InvestigationRequest) -> Self {
        Self {
            id,
            request,
            created_at: Utc::now(),
            completed_at: None,
            state: InvestigationState::Created,
            cancelled: false,
            tiers_run: Vec::new(),
            per_module_results: BTreeMap::new(),
            cross_platform_results: Vec::new(),
            identifiers: Vec::new(),
            correlation_edges: Vec::new(),
            enrichment: BTreeMap::new(),
        }
    }

    /// Every collector output that succeeded, tagged with the call that produced it.
    pub fn collector_outputs(&self) -> Vec<(Provenance, &Value)> {
        let direct = self
            .per_module_results
            .iter()
            .filter_map(|(module, outcome)| outcome.data().map(|d| (Provenance::direct(module), d)));
        let fan_out = self.cross_platform_results.iter().filter_map(|entry| {
            entry
                .outcome
                .data()
                .map(|d| (Provenance::fan_out(&entry.module, &entry.identifier), d))
        });
        direct.chain(fan_out).collect()
    }

    /// Whether any collector ran and whether one of them found something.
    /// Cancelled calls, whether never started or abandoned, do not count as attempts.
    pub fn coverage(&self) -> Coverage {
        let mut outcomes = self
            .per_module_results
            .values()
            .chain(self.cross_platform_results.iter().map(|e| &e.outcome))
            .filter(|outcome| !matches!(outcome, ModuleOutcome::Cancelled))
            .peekable();
        if outcomes.peek().is_none() {
            return Coverage::NoCollectorAttempted;
        }
        if outcomes.any(ModuleOutcome::has_data) {
            Coverage::DataFound
        } else {
            Coverage::NoDataFound
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

// ============================================================================
// Tests
// ============================================================================
