#![allow(dead_code)]

use pagescripts::ScriptManager;
use pagescripts::config::Config;
use pagescripts::host::{ExecutionContext, HeadlessPage, PageHost};
use pagescripts::metadata::ScriptMetadata;
use pagescripts::model::{ScriptId, ScriptRecord};
use pagescripts::storage::{JsonFileStore, RecordStore};
use std::sync::Arc;
use tempfile::TempDir;

/// A manager over a temporary data directory, driving a headless page
pub struct TestContext {
    pub dir: TempDir,
    pub page: Arc<HeadlessPage>,
    pub manager: ScriptManager,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::build(|_| {}, Vec::new(), HeadlessPage::new().unwrap()).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut Config)) -> Self {
        Self::build(configure, Vec::new(), HeadlessPage::new().unwrap()).await
    }

    /// Start with `records` already persisted
    pub async fn with_records(records: Vec<ScriptRecord>) -> Self {
        Self::build(|_| {}, records, HeadlessPage::new().unwrap()).await
    }

    pub async fn with_page(page: HeadlessPage, configure: impl FnOnce(&mut Config)) -> Self {
        Self::build(configure, Vec::new(), page).await
    }

    pub async fn build(
        configure: impl FnOnce(&mut Config),
        records: Vec<ScriptRecord>,
        page: HeadlessPage,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::test_config(dir.path());
        configure(&mut config);

        let backend = Arc::new(JsonFileStore::in_dir(dir.path()));
        if !records.is_empty() {
            backend.save_scripts(&records).await.unwrap();
        }

        let page = Arc::new(page);
        let host: Arc<dyn PageHost> = page.clone();
        let manager = ScriptManager::new(config, backend, host).await.unwrap();

        Self { dir, page, manager }
    }

    /// A second manager over the same data directory, as after a restart
    pub async fn reopen(&self) -> ScriptManager {
        let config = Config::test_config(self.dir.path());
        let host: Arc<dyn PageHost> = Arc::new(HeadlessPage::new().unwrap());
        ScriptManager::with_data_dir(config, host).await.unwrap()
    }

    /// Evaluate `expr` in the page's own realm
    pub async fn page_eval(&self, expr: &str) -> String {
        self.page
            .evaluate(ExecutionContext::Page, expr)
            .await
            .unwrap()
    }

    pub fn ids(&self) -> Vec<ScriptId> {
        self.manager
            .get_scripts()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect()
    }
}

/// A remote record with a fixed id, built without touching the network
pub fn remote_record(
    id: &str,
    name: &str,
    order: i64,
    requires: &[&str],
    code: &str,
) -> ScriptRecord {
    let metadata = ScriptMetadata {
        name: Some(name.to_string()),
        version: Some("1".to_string()),
        requires: requires.iter().map(|r| r.to_string()).collect(),
        ..Default::default()
    };
    let mut record = ScriptRecord::remote(
        &format!("https://scripts.test/{id}.user.js"),
        code.to_string(),
        &metadata,
        chrono::Utc::now(),
        order,
    );
    record.id = ScriptId::from(id);
    record
}

/// Script body that appends `label` to `window.__order`
pub fn recorder(label: &str) -> String {
    format!("(window.__order = window.__order || []).push('{label}');")
}
