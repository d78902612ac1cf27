//! Shared harness for the integration tests: a full application stack over
//! a temporary SQLite record store, the in-memory index and fake source
//! APIs.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use protostar::backends::sqlite::SqliteJobStore;
use protostar::{Connection, Feature};
use sqlx::Row;
use tempfile::NamedTempFile;

use accretion::build_app_state;
use accretion::config::Settings;
use accretion::connections::drive::{
    ArticleTemplate, DriveApi, DriveApiFactory, DriveArticle, TemplateDetails,
};
use accretion::connections::hub::{HubApi, HubApiFactory, HubArticle, HubSection};
use accretion::connections::kms::{KmsApi, KmsApiFactory, KmsArticle};
use accretion::embedding::Embedder;
use accretion::index::{DocRef, DocumentIndex, IndexError, IndexedChunk, MemoryIndex};
use accretion::indexing::IndexingChain;
use accretion::state::AppState;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Deterministic embedder; vector contents are irrelevant to the tests.
pub struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.25; 8]).collect())
    }
}

pub struct TestStack {
    pub state: AppState,
    pub index: Arc<MemoryIndex>,
    pub store: Arc<SqliteJobStore>,
    _db: NamedTempFile,
}

pub async fn build_stack(features: Vec<Arc<dyn Feature<IndexingChain>>>) -> TestStack {
    let db = NamedTempFile::new().unwrap();
    let settings = Arc::new(Settings {
        database_path: db.path().to_string_lossy().into_owned(),
        max_job_workers: 2,
        node_name: "test-node".to_string(),
        ..Settings::default()
    });

    let store = Arc::new(
        SqliteJobStore::open(&settings.database_path).await.unwrap(),
    );
    let index = Arc::new(MemoryIndex::new());
    let state = build_app_state(
        settings,
        store.clone(),
        index.clone(),
        Arc::new(StubEmbedder),
        features,
    );

    TestStack {
        state,
        index,
        store,
        _db: db,
    }
}

/// Steps of the job that are neither DONE nor ERROR yet.
async fn unfinished_steps(store: &SqliteJobStore, job_id: i64) -> (i64, i64) {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total,
                SUM(CASE WHEN status < 3000 THEN 1 ELSE 0 END) AS unfinished
         FROM job_steps WHERE job_id = ?",
    )
    .bind(job_id)
    .fetch_one(store.pool())
    .await
    .unwrap();
    (
        row.get::<i64, _>("total"),
        row.get::<Option<i64>, _>("unfinished").unwrap_or(0),
    )
}

/// Waits until every step of the job reached a terminal status.
pub async fn wait_settled(store: &SqliteJobStore, job_id: i64) {
    for _ in 0..400 {
        let (total, unfinished) = unfinished_steps(store, job_id).await;
        if total > 0 && unfinished == 0 {
            // Let any execute-steps round triggered by the last handler
            // observe the now-empty queue.
            tokio::time::sleep(Duration::from_millis(100)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for job {job_id} to settle");
}

/// (kind, status, doc_id, doc_display_id) of every step of the job, in
/// display-id order.
pub async fn job_steps(
    store: &SqliteJobStore,
    job_id: i64,
) -> Vec<(i64, i64, Option<String>, Option<String>)> {
    let rows = sqlx::query(
        "SELECT kind, status, doc_id, doc_display_id FROM job_steps
         WHERE job_id = ? ORDER BY display_id ASC",
    )
    .bind(job_id)
    .fetch_all(store.pool())
    .await
    .unwrap();
    rows.iter()
        .map(|row| {
            (
                row.get("kind"),
                row.get("status"),
                row.get("doc_id"),
                row.get("doc_display_id"),
            )
        })
        .collect()
}

/// Index wrapper counting the delete and bulk-insert calls reaching it.
#[derive(Default)]
pub struct CountingIndex {
    pub inner: MemoryIndex,
    pub delete_calls: AtomicUsize,
    pub bulk_calls: AtomicUsize,
}

#[async_trait]
impl DocumentIndex for CountingIndex {
    async fn index_exists(&self) -> Result<bool, IndexError> {
        self.inner.index_exists().await
    }

    async fn create_index(&self) -> Result<(), IndexError> {
        self.inner.create_index().await
    }

    async fn delete_by_key(
        &self,
        datasource: &str,
        key_field: &str,
        key_value: &str,
        connection_ids: &[String],
    ) -> Result<u64, IndexError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .delete_by_key(datasource, key_field, key_value, connection_ids)
            .await
    }

    async fn insert_chunks(&self, chunks: Vec<IndexedChunk>) -> Result<(), IndexError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.insert_chunks(chunks).await
    }

    fn scroll_doc_refs(
        &self,
        datasource: String,
        key_field: Option<String>,
        key_value: Option<String>,
    ) -> BoxStream<'static, Result<DocRef, IndexError>> {
        self.inner.scroll_doc_refs(datasource, key_field, key_value)
    }

    async fn ping(&self) -> Result<(), IndexError> {
        self.inner.ping().await
    }
}

/// Like [`build_stack`] but over an arbitrary index implementation.
pub async fn build_stack_with_index(
    features: Vec<Arc<dyn Feature<IndexingChain>>>,
    index: Arc<dyn DocumentIndex>,
) -> (AppState, Arc<SqliteJobStore>, NamedTempFile) {
    let db = NamedTempFile::new().unwrap();
    let settings = Arc::new(Settings {
        database_path: db.path().to_string_lossy().into_owned(),
        max_job_workers: 2,
        node_name: "test-node".to_string(),
        ..Settings::default()
    });
    let store = Arc::new(
        SqliteJobStore::open(&settings.database_path).await.unwrap(),
    );
    let state = build_app_state(settings, store.clone(), index, Arc::new(StubEmbedder), features);
    (state, store, db)
}

// ---------------------------------------------------------------------------
// Fake source APIs

#[derive(Default)]
pub struct FakeKmsApi {
    pub articles: BTreeMap<i64, KmsArticle>,
}

impl FakeKmsApi {
    pub fn with_articles(ids: &[i64]) -> Arc<Self> {
        let articles = ids
            .iter()
            .map(|&id| {
                (
                    id,
                    KmsArticle {
                        content_id: id,
                        title: format!("Article {id}"),
                        body: format!("Body of article {id}."),
                        language: Some("en".to_string()),
                        tags: None,
                    },
                )
            })
            .collect();
        Arc::new(Self { articles })
    }
}

#[async_trait]
impl KmsApi for FakeKmsApi {
    async fn article_ids(&self, content_id: Option<i64>) -> anyhow::Result<BTreeSet<i64>> {
        Ok(match content_id {
            Some(content_id) => self
                .articles
                .contains_key(&content_id)
                .then_some(content_id)
                .into_iter()
                .collect(),
            None => self.articles.keys().copied().collect(),
        })
    }

    async fn get_article(&self, content_id: i64) -> anyhow::Result<Option<KmsArticle>> {
        Ok(self.articles.get(&content_id).cloned())
    }
}

pub struct FakeKmsFactory(pub Arc<FakeKmsApi>);

impl KmsApiFactory for FakeKmsFactory {
    fn open(&self, _connection: Option<&Connection>) -> anyhow::Result<Arc<dyn KmsApi>> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct FakeDriveApi {
    pub articles: BTreeMap<String, (DriveArticle, TemplateDetails)>,
}

impl FakeDriveApi {
    pub fn with_display_ids(display_ids: &[&str]) -> Arc<Self> {
        let articles = display_ids
            .iter()
            .map(|&display_id| {
                (
                    display_id.to_string(),
                    (
                        DriveArticle {
                            display_id: display_id.to_string(),
                            guid: Some(format!("guid-{display_id}")),
                            template: Some("howto".to_string()),
                            title: format!("Article {display_id}"),
                            language: Some("English".to_string()),
                            internal: Some(false),
                            company: None,
                        },
                        TemplateDetails::HowTo {
                            question: format!("What is {display_id}?"),
                            answer: format!("Answer for {display_id}."),
                            technician_notes: String::new(),
                        },
                    ),
                )
            })
            .collect();
        Arc::new(Self { articles })
    }
}

#[async_trait]
impl DriveApi for FakeDriveApi {
    async fn document_display_ids(
        &self,
        display_id: Option<&str>,
        _modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<String>> {
        Ok(match display_id {
            Some(display_id) => self
                .articles
                .contains_key(display_id)
                .then(|| display_id.to_string())
                .into_iter()
                .collect(),
            None => self.articles.keys().cloned().collect(),
        })
    }

    async fn get_article(&self, display_id: &str) -> anyhow::Result<Option<DriveArticle>> {
        Ok(self
            .articles
            .get(display_id)
            .map(|(article, _)| article.clone()))
    }

    async fn get_template_details(
        &self,
        _template: ArticleTemplate,
        guid: &str,
    ) -> anyhow::Result<Option<TemplateDetails>> {
        Ok(self
            .articles
            .values()
            .find(|(article, _)| article.guid.as_deref() == Some(guid))
            .map(|(_, details)| details.clone()))
    }
}

pub struct FakeDriveFactory(pub Arc<FakeDriveApi>);

impl DriveApiFactory for FakeDriveFactory {
    fn open(&self, _connection: Option<&Connection>) -> anyhow::Result<Arc<dyn DriveApi>> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct FakeHubApi {
    pub articles: BTreeMap<String, HubArticle>,
}

impl FakeHubApi {
    pub fn with_uuids(uuids: &[&str]) -> Arc<Self> {
        let articles = uuids
            .iter()
            .map(|&uuid| {
                (
                    uuid.to_string(),
                    HubArticle {
                        uuid: uuid.to_string(),
                        content_id: format!("KB-{uuid}"),
                        template_name: "outage".to_string(),
                        title: format!("Hub article {uuid}"),
                        sections: vec![
                            HubSection {
                                label: "Symptoms".to_string(),
                                content: format!("Symptoms of {uuid}"),
                            },
                            HubSection {
                                label: "Resolution".to_string(),
                                content: "Apply the fix".to_string(),
                            },
                        ],
                        external: false,
                        locale: Some("en".to_string()),
                    },
                )
            })
            .collect();
        Arc::new(Self { articles })
    }
}

#[async_trait]
impl HubApi for FakeHubApi {
    async fn article_uuids(
        &self,
        display_id: Option<&str>,
        _modified_since: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<String>> {
        Ok(match display_id {
            Some(display_id) => self
                .articles
                .values()
                .filter(|article| article.content_id == display_id)
                .map(|article| article.uuid.clone())
                .collect(),
            None => self.articles.keys().cloned().collect(),
        })
    }

    async fn article_display_ids(&self, display_id: Option<&str>) -> anyhow::Result<Vec<String>> {
        Ok(self
            .articles
            .values()
            .map(|article| article.content_id.clone())
            .filter(|content_id| display_id.is_none() || display_id == Some(content_id.as_str()))
            .collect())
    }

    async fn get_article(&self, uuid: &str) -> anyhow::Result<Option<HubArticle>> {
        Ok(self.articles.get(uuid).cloned())
    }

    async fn article_company(&self, _uuid: &str) -> anyhow::Result<Option<String>> {
        Ok(Some("Acme".to_string()))
    }
}

pub struct FakeHubFactory(pub Arc<FakeHubApi>);

impl HubApiFactory for FakeHubFactory {
    fn open(&self, _connection: Option<&Connection>) -> anyhow::Result<Arc<dyn HubApi>> {
        Ok(self.0.clone())
    }
}
