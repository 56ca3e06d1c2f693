//! Per-dataset vocabularies and hallucinated-reference detection.
//!
//! [`SchemaDictionary`] is an injected service: it owns the loaded tables,
//! caches a vocabulary snapshot per dataset and rebuilds it when the TTL
//! elapses or on explicit [`SchemaDictionary::refresh`]. A rebuild takes the
//! write lock, so concurrent validations wait for it to finish.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, LazyLock, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use lru::LruCache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::columns::LogicalField;
use crate::table::{Cell, Table};

pub const SCHEMA_CACHE_TTL: Duration = Duration::from_secs(600);
const REFERENCE_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(128) {
    Some(capacity) => capacity,
    None => NonZeroUsize::MIN,
};
const SUGGESTION_MIN_SIMILARITY: f64 = 0.85;
const TOKEN_TRIM: &[char] = &[',', '.', '!', '?', ';', ':', '"', '(', ')', '[', ']', '{', '}'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VocabularyKind {
    Columns,
    Activities,
    Teams,
    Users,
    Processes,
    WindowTitles,
}

impl VocabularyKind {
    pub const ALL: [VocabularyKind; 6] = [
        VocabularyKind::Columns,
        VocabularyKind::Activities,
        VocabularyKind::Teams,
        VocabularyKind::Users,
        VocabularyKind::Processes,
        VocabularyKind::WindowTitles,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            VocabularyKind::Columns => "columns",
            VocabularyKind::Activities => "activities",
            VocabularyKind::Teams => "teams",
            VocabularyKind::Users => "users",
            VocabularyKind::Processes => "processes",
            VocabularyKind::WindowTitles => "window_titles",
        }
    }
}

/// Distinct values with a case-folded index.
#[derive(Debug, Clone, Default)]
pub struct TermSet {
    values: BTreeSet<String>,
    folded: HashSet<String>,
}

impl TermSet {
    fn insert(&mut self, value: String) {
        self.folded.insert(value.to_lowercase());
        self.values.insert(value);
    }

    pub fn contains_ignore_case(&self, value: &str) -> bool {
        self.folded.contains(&value.to_lowercase())
    }

    pub fn values(&self) -> &BTreeSet<String> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    columns: TermSet,
    activities: TermSet,
    teams: TermSet,
    users: TermSet,
    processes: TermSet,
    window_titles: TermSet,
}

impl Vocabulary {
    pub fn from_table(table: &Table) -> Self {
        let mut vocabulary = Vocabulary::default();
        for column in table.columns() {
            vocabulary.columns.insert(column.clone());
        }

        let fields = [
            (LogicalField::Activity, VocabularyKind::Activities),
            (LogicalField::Team, VocabularyKind::Teams),
            (LogicalField::User, VocabularyKind::Users),
            (LogicalField::Process, VocabularyKind::Processes),
            (LogicalField::Title, VocabularyKind::WindowTitles),
        ];
        for (field, kind) in fields {
            let Some(column) = table.resolve(field) else {
                continue;
            };
            let terms = vocabulary.terms_mut(kind);
            for value in table.values(column).filter_map(Cell::key) {
                terms.insert(value);
            }
        }
        vocabulary
    }

    pub fn terms(&self, kind: VocabularyKind) -> &TermSet {
        match kind {
            VocabularyKind::Columns => &self.columns,
            VocabularyKind::Activities => &self.activities,
            VocabularyKind::Teams => &self.teams,
            VocabularyKind::Users => &self.users,
            VocabularyKind::Processes => &self.processes,
            VocabularyKind::WindowTitles => &self.window_titles,
        }
    }

    fn terms_mut(&mut self, kind: VocabularyKind) -> &mut TermSet {
        match kind {
            VocabularyKind::Columns => &mut self.columns,
            VocabularyKind::Activities => &mut self.activities,
            VocabularyKind::Teams => &mut self.teams,
            VocabularyKind::Users => &mut self.users,
            VocabularyKind::Processes => &mut self.processes,
            VocabularyKind::WindowTitles => &mut self.window_titles,
        }
    }

    fn closest_column(&self, token: &str) -> Option<String> {
        let token = token.to_lowercase();
        self.columns
            .values()
            .iter()
            .map(|column| (strsim::jaro_winkler(&token, &column.to_lowercase()), column))
            .filter(|(score, _)| *score >= SUGGESTION_MIN_SIMILARITY)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, column)| column.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Column,
    Team,
    Activity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UnknownEntity {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub value: String,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HallucinationCheck {
    #[serde(default)]
    pub has_hallucinations: bool,
    #[serde(default)]
    pub unknown_entities: Vec<UnknownEntity>,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HallucinationCheck {
    fn unchecked(dataset: &str, reason: impl Into<String>) -> Self {
        Self {
            checked: false,
            dataset: Some(dataset.to_string()),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

static DOUBLE_QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]+)""#).expect("valid double quote regex"));
static SINGLE_QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'([^']+)'").expect("valid single quote regex"));

fn looks_like_column(token: &str) -> bool {
    if token.contains('_') {
        return true;
    }
    let chars: Vec<char> = token.chars().collect();
    chars
        .windows(2)
        .any(|pair| pair[0].is_lowercase() && pair[1].is_uppercase())
}

/// Scan `text` for references that do not exist in `vocabulary`.
pub fn find_unknown_references(text: &str, vocabulary: &Vocabulary) -> Vec<UnknownEntity> {
    let mut unknown = Vec::new();

    for word in text.split_whitespace() {
        let token = word.trim_matches(TOKEN_TRIM);
        if token.chars().count() < 3 || vocabulary.columns.contains_ignore_case(token) {
            continue;
        }
        if looks_like_column(token) {
            unknown.push(UnknownEntity {
                kind: EntityKind::Column,
                value: token.to_string(),
                context: "potential_column_reference".to_string(),
                suggestion: vocabulary.closest_column(token),
            });
        }
    }

    let lowered = text.to_lowercase();
    let mentions_team = lowered.contains("team") || lowered.contains("group");
    let mentions_activity =
        lowered.contains("activity") || lowered.contains("step") || lowered.contains("process");

    let quoted = DOUBLE_QUOTED_RE
        .captures_iter(text)
        .chain(SINGLE_QUOTED_RE.captures_iter(text))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()));

    for value in quoted {
        if mentions_team
            && !vocabulary.teams.is_empty()
            && !vocabulary.teams.contains_ignore_case(value)
        {
            unknown.push(UnknownEntity {
                kind: EntityKind::Team,
                value: value.to_string(),
                context: "quoted_team_reference".to_string(),
                suggestion: None,
            });
        }
        if mentions_activity
            && !vocabulary.activities.is_empty()
            && !vocabulary.activities.contains_ignore_case(value)
        {
            unknown.push(UnknownEntity {
                kind: EntityKind::Activity,
                value: value.to_string(),
                context: "quoted_activity_reference".to_string(),
                suggestion: None,
            });
        }
    }

    unknown
}

struct Snapshot {
    built_at: Instant,
    generation: u64,
    vocabularies: BTreeMap<String, Arc<Vocabulary>>,
}

pub struct SchemaDictionary {
    sources: BTreeMap<String, Arc<Table>>,
    ttl: Duration,
    snapshot: RwLock<Snapshot>,
}

impl SchemaDictionary {
    pub fn new(sources: BTreeMap<String, Arc<Table>>) -> Self {
        Self::with_ttl(sources, SCHEMA_CACHE_TTL)
    }

    pub fn with_ttl(sources: BTreeMap<String, Arc<Table>>, ttl: Duration) -> Self {
        let vocabularies = Self::build(&sources);
        Self {
            sources,
            ttl,
            snapshot: RwLock::new(Snapshot {
                built_at: Instant::now(),
                generation: 0,
                vocabularies,
            }),
        }
    }

    fn build(sources: &BTreeMap<String, Arc<Table>>) -> BTreeMap<String, Arc<Vocabulary>> {
        sources
            .iter()
            .map(|(name, table)| (name.clone(), Arc::new(Vocabulary::from_table(table))))
            .collect()
    }

    /// Rebuild every vocabulary now.
    pub fn refresh(&self) {
        let vocabularies = Self::build(&self.sources);
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.vocabularies = vocabularies;
        snapshot.built_at = Instant::now();
        snapshot.generation += 1;
        tracing::info!(
            generation = snapshot.generation,
            datasets = snapshot.vocabularies.len(),
            "Rebuilt schema dictionary"
        );
    }

    pub fn refresh_if_stale(&self) {
        let stale = {
            let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
            snapshot.built_at.elapsed() >= self.ttl
        };
        if stale {
            self.refresh();
        }
    }

    /// Increments on every rebuild.
    pub fn generation(&self) -> u64 {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    pub fn datasets(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn vocabulary(&self, dataset: &str) -> Option<Arc<Vocabulary>> {
        self.refresh_if_stale();
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .vocabularies
            .get(dataset)
            .cloned()
    }

    pub fn valid_values(&self, dataset: &str, kind: VocabularyKind) -> BTreeSet<String> {
        self.vocabulary(dataset)
            .map(|vocabulary| vocabulary.terms(kind).values().clone())
            .unwrap_or_default()
    }

    pub fn validate_references(&self, text: &str, dataset: &str) -> HallucinationCheck {
        let Some(vocabulary) = self.vocabulary(dataset) else {
            return HallucinationCheck::unchecked(dataset, format!("Unknown dataset: {dataset}"));
        };
        let unknown_entities = find_unknown_references(text, &vocabulary);
        HallucinationCheck {
            has_hallucinations: !unknown_entities.is_empty(),
            unknown_entities,
            checked: true,
            dataset: Some(dataset.to_string()),
            reason: None,
        }
    }
}

struct ReferenceCache {
    generation: u64,
    entries: LruCache<(u64, String), HallucinationCheck>,
}

/// Memoizes [`SchemaDictionary::validate_references`] keyed by a hash of
/// the text and the dataset. Entries are dropped when the dictionary
/// rebuilds.
pub struct CachedReferenceValidator {
    schema: Arc<SchemaDictionary>,
    cache: Mutex<ReferenceCache>,
}

impl CachedReferenceValidator {
    pub fn new(schema: Arc<SchemaDictionary>) -> Self {
        Self {
            schema,
            cache: Mutex::new(ReferenceCache {
                generation: 0,
                entries: LruCache::new(REFERENCE_CACHE_CAPACITY),
            }),
        }
    }

    pub fn schema(&self) -> &SchemaDictionary {
        &self.schema
    }

    pub fn validate(&self, text: &str, dataset: &str) -> HallucinationCheck {
        self.schema.refresh_if_stale();
        let generation = self.schema.generation();
        let key = (text_hash(text), dataset.to_string());

        {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if cache.generation != generation {
                cache.entries.clear();
                cache.generation = generation;
            }
            if let Some(hit) = cache.entries.get(&key) {
                return hit.clone();
            }
        }

        let check = self.schema.validate_references(text, dataset);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .put(key, check.clone());
        check
    }

    pub fn cached_entries(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

fn text_hash(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dictionary() -> Arc<SchemaDictionary> {
        let table = Table::from_json_str(
            &json!([
                {"case_id": "C1", "team": "Sales", "activity": "Review", "user": "ana", "process_name": "crm", "window_title": "Inbox"},
                {"case_id": "C2", "team": "Support", "activity": "Close Case", "user": "ben", "process_name": "mail", "window_title": "Draft"},
            ])
            .to_string(),
        )
        .expect("fixture parses");
        let mut sources = BTreeMap::new();
        sources.insert("salesforce".to_string(), Arc::new(table));
        Arc::new(SchemaDictionary::new(sources))
    }

    #[test]
    fn vocabulary_collects_distinct_values() {
        let schema = dictionary();
        assert_eq!(
            schema.valid_values("salesforce", VocabularyKind::Teams),
            BTreeSet::from(["Sales".to_string(), "Support".to_string()])
        );
        assert_eq!(schema.valid_values("salesforce", VocabularyKind::WindowTitles).len(), 2);
        assert!(schema.valid_values("unknown", VocabularyKind::Teams).is_empty());
    }

    #[test]
    fn flags_unknown_column_like_tokens_with_suggestion() {
        let check = dictionary().validate_references("Grouped by case_idd and avgWait.", "salesforce");
        assert!(check.checked);
        assert!(check.has_hallucinations);
        let values: Vec<&str> = check.unknown_entities.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(values, vec!["case_idd", "avgWait"]);
        assert_eq!(check.unknown_entities[0].kind, EntityKind::Column);
        assert_eq!(check.unknown_entities[0].suggestion.as_deref(), Some("case_id"));
    }

    #[test]
    fn known_columns_are_not_flagged() {
        let check = dictionary().validate_references("Counted CASE_ID per team.", "salesforce");
        assert!(!check.has_hallucinations);
        assert!(check.unknown_entities.is_empty());
    }

    #[test]
    fn flags_unknown_quoted_team() {
        let check = dictionary().validate_references(r#"The team "Marketing" was slowest."#, "salesforce");
        assert!(check.has_hallucinations);
        assert_eq!(check.unknown_entities.len(), 1);
        assert_eq!(check.unknown_entities[0].kind, EntityKind::Team);
        assert_eq!(check.unknown_entities[0].context, "quoted_team_reference");
    }

    #[test]
    fn known_quoted_values_match_case_insensitively() {
        let schema = dictionary();
        let team = schema.validate_references("The team 'sales' was fastest.", "salesforce");
        assert!(!team.has_hallucinations, "{:?}", team.unknown_entities);
        let steps = schema.validate_references("The 'close case' step follows 'review'.", "salesforce");
        assert!(!steps.has_hallucinations, "{:?}", steps.unknown_entities);
    }

    #[test]
    fn flags_unknown_quoted_activity() {
        let check = dictionary().validate_references(r#"The "Escalate" step took long."#, "salesforce");
        let kinds: Vec<EntityKind> = check.unknown_entities.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EntityKind::Activity]);
    }

    #[test]
    fn unknown_dataset_is_not_checked() {
        let check = dictionary().validate_references("anything", "nope");
        assert!(!check.checked);
        assert!(!check.has_hallucinations);
        assert!(check.reason.is_some());
    }

    #[test]
    fn refresh_bumps_generation() {
        let schema = dictionary();
        assert_eq!(schema.generation(), 0);
        schema.refresh();
        assert_eq!(schema.generation(), 1);
    }

    #[test]
    fn zero_ttl_rebuilds_on_access() {
        let mut sources = BTreeMap::new();
        sources.insert("amadeus".to_string(), Arc::new(Table::default()));
        let schema = SchemaDictionary::with_ttl(sources, Duration::ZERO);
        let _ = schema.vocabulary("amadeus");
        assert!(schema.generation() >= 1);
    }

    #[test]
    fn cached_validator_validates_the_real_text() {
        let validator = CachedReferenceValidator::new(dictionary());
        let first = validator.validate("Look at case_idd", "salesforce");
        assert!(first.has_hallucinations);
        let again = validator.validate("Look at case_idd", "salesforce");
        assert_eq!(first, again);
        assert_eq!(validator.cached_entries(), 1);

        let clean = validator.validate("Look at case_id", "salesforce");
        assert!(!clean.has_hallucinations);
        assert_eq!(validator.cached_entries(), 2);
    }

    #[test]
    fn cache_clears_after_rebuild() {
        let validator = CachedReferenceValidator::new(dictionary());
        validator.validate("Look at case_idd", "salesforce");
        validator.schema().refresh();
        validator.validate("Look at case_id", "salesforce");
        assert_eq!(validator.cached_entries(), 1);
    }
}
