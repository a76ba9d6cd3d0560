//! Recording fakes for the external services plus an engine wired to them.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use appraisal_pipeline::artifacts::{ArtifactBuilder, Artifacts};
use appraisal_pipeline::content::{ContentService, Post};
use appraisal_pipeline::db::{self, Pool};
use appraisal_pipeline::describer::DescriptionGenerator;
use appraisal_pipeline::error::ServiceError;
use appraisal_pipeline::notifier::{Email, Notifier};
use appraisal_pipeline::pipeline::{Engine, PipelineSettings, Services};
use appraisal_pipeline::record::{AppraisalRecord, Field};
use appraisal_pipeline::sheets::{AppraisalSheet, RecordStore};

pub const PENDING: &str = "Pending Appraisals";
pub const COMPLETED: &str = "Completed Appraisals";

// ---- record store ----

fn col_index(c: char) -> usize {
    (c as u8 - b'A') as usize
}

/// `'Sheet'!J42:K42` -> (sheet, first col, last col, first row, last row)
fn parse_range(range: &str) -> (String, usize, usize, u32, Option<u32>) {
    let (sheet, cells) = range.rsplit_once('!').expect("range has a sheet");
    let sheet = sheet.trim_matches('\'').replace("''", "'");
    let (start, end) = cells.split_once(':').unwrap_or((cells, cells));
    let split = |cell: &str| {
        let col = cell.chars().next().expect("column letter");
        let row = cell[1..].parse::<u32>().ok();
        (col_index(col), row)
    };
    let (c0, r0) = split(start);
    let (c1, r1) = split(end);
    (sheet, c0, c1, r0.expect("start row"), r1)
}

/// Spreadsheet kept in memory, addressed with the same ranges the real API takes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    sheets: Arc<Mutex<HashMap<String, BTreeMap<u32, Vec<String>>>>>,
    pub update_calls: Arc<Mutex<Vec<String>>>,
    fail_writes: Arc<Mutex<Vec<String>>>,
}

impl MemoryStore {
    /// The next write carrying `value` fails with a 503.
    pub async fn fail_write_of(&self, value: &str) {
        self.fail_writes.lock().await.push(value.to_string());
    }

    pub async fn put_row(&self, sheet: &str, row: u32, values: Vec<String>) {
        let mut sheets = self.sheets.lock().await;
        sheets.entry(sheet.to_string()).or_default().insert(row, values);
    }

    pub async fn row(&self, sheet: &str, row: u32) -> Vec<String> {
        let sheets = self.sheets.lock().await;
        let mut out = sheets
            .get(sheet)
            .and_then(|s| s.get(&row))
            .cloned()
            .unwrap_or_default();
        out.resize(Field::ALL.len(), String::new());
        out
    }

    pub async fn record(&self, row: u32) -> AppraisalRecord {
        AppraisalRecord::from_row(row, &self.row(PENDING, row).await)
    }

    pub async fn rows(&self, sheet: &str) -> Vec<Vec<String>> {
        let sheets = self.sheets.lock().await;
        sheets
            .get(sheet)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, ServiceError> {
        let (sheet, c0, c1, r0, r1) = parse_range(range);
        let sheets = self.sheets.lock().await;
        let Some(rows) = sheets.get(&sheet) else {
            return Ok(Vec::new());
        };
        let last = r1.unwrap_or_else(|| rows.keys().last().copied().unwrap_or(0));
        let mut out = Vec::new();
        for row in r0..=last {
            let mut cells = rows.get(&row).cloned().unwrap_or_default();
            cells.resize(c1 + 1, String::new());
            out.push(cells[c0..=c1].to_vec());
        }
        Ok(out)
    }

    async fn update_values(
        &self,
        range: &str,
        values: Vec<Vec<String>>,
    ) -> Result<(), ServiceError> {
        self.update_calls.lock().await.push(range.to_string());
        {
            let mut failing = self.fail_writes.lock().await;
            if let Some(pos) = failing
                .iter()
                .position(|v| values.iter().flatten().any(|cell| cell == v))
            {
                failing.remove(pos);
                return Err(ServiceError::Status {
                    service: "sheets",
                    status: 503,
                    body: "busy".into(),
                });
            }
        }
        let (sheet, c0, _c1, r0, _r1) = parse_range(range);
        let mut sheets = self.sheets.lock().await;
        let rows = sheets.entry(sheet).or_default();
        for (i, new) in values.into_iter().enumerate() {
            let cells = rows.entry(r0 + i as u32).or_default();
            if cells.len() < c0 + new.len() {
                cells.resize(c0 + new.len(), String::new());
            }
            for (j, v) in new.into_iter().enumerate() {
                cells[c0 + j] = v;
            }
        }
        Ok(())
    }

    async fn append_values(
        &self,
        range: &str,
        values: Vec<Vec<String>>,
    ) -> Result<(), ServiceError> {
        let (sheet, _, _, r0, _) = parse_range(range);
        let mut sheets = self.sheets.lock().await;
        let rows = sheets.entry(sheet).or_default();
        let mut next = rows.keys().last().map(|r| r + 1).unwrap_or(r0).max(r0);
        for row in values {
            rows.insert(next, row);
            next += 1;
        }
        Ok(())
    }
}

// ---- content ----

#[derive(Clone, Default)]
pub struct FakeContent {
    pub posts: Arc<Mutex<HashMap<u64, Post>>>,
    pub writes: Arc<Mutex<Vec<(u64, Value)>>>,
}

impl FakeContent {
    pub async fn insert(&self, post: Post) {
        self.posts.lock().await.insert(post.id, post);
    }

    pub async fn post(&self, id: u64) -> Post {
        self.posts.lock().await.get(&id).cloned().expect("post exists")
    }

    pub async fn write_count(&self) -> usize {
        self.writes.lock().await.len()
    }
}

#[async_trait]
impl ContentService for FakeContent {
    async fn get_post(&self, post_id: u64) -> Result<Post, ServiceError> {
        self.posts
            .lock()
            .await
            .get(&post_id)
            .cloned()
            .ok_or(ServiceError::Status {
                service: "content",
                status: 404,
                body: "{\"code\":\"rest_post_invalid_id\"}".into(),
            })
    }

    async fn write_post(&self, post_id: u64, body: Value) -> Result<Post, ServiceError> {
        self.writes.lock().await.push((post_id, body.clone()));
        let mut posts = self.posts.lock().await;
        let post = posts.get_mut(&post_id).ok_or(ServiceError::Status {
            service: "content",
            status: 404,
            body: String::new(),
        })?;
        if let Some(title) = body.get("title").and_then(Value::as_str) {
            post.title = title.to_string();
        }
        if let Some(content) = body.get("content").and_then(Value::as_str) {
            post.content = content.to_string();
        }
        if let Some(acf) = body.get("acf").and_then(Value::as_object) {
            post.acf = acf.clone();
        }
        Ok(post.clone())
    }
}

// ---- describer ----

#[derive(Clone, Default)]
pub struct FakeDescriber {
    pub merge_calls: Arc<Mutex<Vec<(String, String)>>>,
    pub image_calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl DescriptionGenerator for FakeDescriber {
    async fn describe_image(&self, image_url: &str) -> Result<String, ServiceError> {
        self.image_calls.lock().await.push(image_url.to_string());
        Ok("A painting of a landscape.".into())
    }

    async fn merge_descriptions(&self, appraiser: &str, ai: &str) -> Result<String, ServiceError> {
        self.merge_calls
            .lock()
            .await
            .push((appraiser.to_string(), ai.to_string()));
        Ok(format!(
            "{} {}",
            appraiser.trim_end_matches('.'),
            ai.trim_end_matches('.').to_lowercase().replacen("a ", "depicting a ", 1)
        ))
    }
}

// ---- notifier ----

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub failures: Arc<Mutex<VecDeque<ServiceError>>>,
    pub sent: Arc<Mutex<Vec<Email>>>,
}

impl RecordingNotifier {
    pub async fn fail_next(&self, err: ServiceError) {
        self.failures.lock().await.push_back(err);
    }

    pub async fn sent(&self) -> Vec<Email> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, email: &Email) -> Result<(), ServiceError> {
        if let Some(err) = self.failures.lock().await.pop_front() {
            return Err(err);
        }
        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}

// ---- artifacts ----

#[derive(Clone, Default)]
pub struct FakeArtifacts {
    pub failures: Arc<Mutex<VecDeque<ServiceError>>>,
    pub calls: Arc<Mutex<Vec<(u64, String)>>>,
    pub delay: Option<Duration>,
}

#[async_trait]
impl ArtifactBuilder for FakeArtifacts {
    async fn build(&self, post_id: u64, session_id: &str) -> Result<Artifacts, ServiceError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls
            .lock()
            .await
            .push((post_id, session_id.to_string()));
        if let Some(err) = self.failures.lock().await.pop_front() {
            return Err(err);
        }
        Ok(Artifacts {
            pdf_link: format!("https://docs.test/{post_id}.pdf"),
            doc_link: format!("https://docs.test/{post_id}.docx"),
        })
    }
}

// ---- harness ----

pub struct Harness {
    pub engine: Engine,
    pub pool: Pool,
    pub store: MemoryStore,
    pub content: FakeContent,
    pub describer: FakeDescriber,
    pub notifier: RecordingNotifier,
    pub artifacts: FakeArtifacts,
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        completed_template_id: "d-completed".into(),
        update_template_id: "d-update".into(),
        update_delay: Duration::from_secs(120),
        dashboard_url: "https://example.com/dashboard".into(),
        step_deadline: Duration::from_secs(5),
        move_completed: false,
    }
}

pub async fn setup_pool() -> Pool {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub async fn harness() -> Harness {
    harness_with(settings(), FakeArtifacts::default()).await
}

pub async fn harness_with(settings: PipelineSettings, artifacts: FakeArtifacts) -> Harness {
    let pool = setup_pool().await;
    let store = MemoryStore::default();
    let content = FakeContent::default();
    let describer = FakeDescriber::default();
    let notifier = RecordingNotifier::default();

    let services = Services {
        sheet: AppraisalSheet::new(Arc::new(store.clone()), PENDING.into(), COMPLETED.into()),
        content: Arc::new(content.clone()),
        describer: Arc::new(describer.clone()),
        notifier: Arc::new(notifier.clone()),
        artifacts: Arc::new(artifacts.clone()),
    };
    Harness {
        engine: Engine::new(services, pool.clone(), settings),
        pool,
        store,
        content,
        describer,
        notifier,
        artifacts,
    }
}

/// Pending row `id` as intake leaves it.
pub fn pending_record(id: u32, content_url: &str) -> AppraisalRecord {
    let mut rec = AppraisalRecord {
        id,
        ..Default::default()
    };
    rec.set(Field::Date, "2025-03-01");
    rec.set(Field::AppraisalType, "RegularArt");
    rec.set(Field::Identifier, "sess-1");
    rec.set(Field::CustomerEmail, "jane@example.com");
    rec.set(Field::CustomerName, "Jane Doe");
    rec.set(Field::Status, "Pending");
    rec.set(Field::ContentUrl, content_url);
    rec.set(Field::AiDescription, "A painting of a landscape.");
    rec.set(Field::CustomerDescription, "Old painting from my grandmother");
    rec.set(
        Field::ImagesJson,
        r#"{"main":"https://img/main.jpg"}"#,
    );
    rec
}

pub fn post(id: u64) -> Post {
    let mut acf = Map::new();
    acf.insert("session_id".into(), json!("sess-1"));
    acf.insert("customer_note".into(), json!("keep me"));
    Post {
        id,
        title: "Pending appraisal".into(),
        content: "<p>Intro</p>".into(),
        link: format!("https://cms.test/appraisals/{id}/"),
        acf,
    }
}

impl Harness {
    /// Record 42 pointing at post 987.
    pub async fn seed_default(&self) {
        self.seed(pending_record(42, "https://cms.test/wp-admin/post.php?post=987&action=edit"))
            .await;
        self.content.insert(post(987)).await;
    }

    pub async fn seed(&self, rec: AppraisalRecord) {
        self.store.put_row(PENDING, rec.id, rec.to_row()).await;
    }
}
