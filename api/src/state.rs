use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use taskmine_core::schema::{CachedReferenceValidator, SchemaDictionary};
use taskmine_core::table::Table;
use taskmine_core::trace::TraceStore;
use taskmine_core::verify::AnswerVerifier;

use crate::config::AppConfig;
use crate::error::AppError;

pub type Datasets = BTreeMap<String, Arc<Table>>;

#[derive(Clone)]
pub struct AppState {
    pub datasets: Arc<Datasets>,
    pub references: Arc<CachedReferenceValidator>,
    pub verifier: Arc<AnswerVerifier>,
    pub traces: TraceStore,
    pub kpi_dir: PathBuf,
}

impl AppState {
    pub fn new(config: &AppConfig, datasets: Datasets) -> Self {
        let schema = SchemaDictionary::with_ttl(datasets.clone(), config.schema_cache_ttl);
        Self {
            datasets: Arc::new(datasets),
            references: Arc::new(CachedReferenceValidator::new(Arc::new(schema))),
            verifier: Arc::new(AnswerVerifier::new(config.tolerance_pct)),
            traces: TraceStore::new(config.trace_dir()),
            kpi_dir: config.kpi_dir(),
        }
    }

    pub fn dataset(&self, name: &str) -> Result<Arc<Table>, AppError> {
        self.datasets
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound {
                resource: format!("dataset/{name}"),
            })
    }

    pub fn schema(&self) -> &SchemaDictionary {
        self.references.schema()
    }
}

/// Load every configured dataset. Missing or unreadable files are logged
/// and skipped so the service still starts with what it has.
pub fn load_datasets(config: &AppConfig) -> Datasets {
    let mut datasets = Datasets::new();
    for (name, file) in &config.dataset_files {
        let path = config.data_dir.join(file);
        match Table::load(&path) {
            Ok(table) => {
                tracing::info!(dataset = %name, rows = table.len(), "Loaded dataset");
                datasets.insert(name.clone(), Arc::new(table));
            }
            Err(e) => {
                tracing::warn!(dataset = %name, error = %e, "Dataset unavailable");
            }
        }
    }
    datasets
}


/// Small salesforce dataset wired into a state whose logs live under `dir`.
#[cfg(test)]
pub fn fixture_state(dir: &std::path::Path) -> AppState {
    let table = Table::from_json_str(
        &serde_json::json!([
            {"case_id": "A", "team": "Sales", "user": "ana", "activity": "Review", "process_name": "crm", "duration_seconds": 10},
            {"case_id": "A", "team": "Sales", "user": "ben", "activity": "Close", "process_name": "crm", "duration_seconds": 20},
            {"case_id": "B", "team": "Ops", "user": "ana", "activity": "Review", "process_name": "mail", "duration_seconds": 20},
            {"case_id": "C", "team": "Ops", "user": "cat", "activity": "Triage", "process_name": "crm", "duration_seconds": 20},
        ])
        .to_string(),
    )
    .expect("fixture parses");
    let config = AppConfig {
        data_dir: dir.to_path_buf(),
        log_dir: dir.join("logs"),
        ..AppConfig::from_lookup(|_| None)
    };
    let mut datasets = Datasets::new();
    datasets.insert("salesforce".to_string(), Arc::new(table));
    datasets.insert("amadeus".to_string(), Arc::new(Table::default()));
    AppState::new(&config, datasets)
}
