//! In-process fakes of the collaborator seams, shared by unit tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tabledex_core::ddl::{self, SCHEMA_HASH_BIND, VERSION_BIND};
use tabledex_core::{ColumnModel, DatabaseColumnInfo, DbValue, ManualClock, ObjectType, ViewTypeMask};
use tokio_util::sync::CancellationToken;

use crate::service::context::TableContext;
use crate::traits::{
    BenefactorAuthorizer, ChangeSet, Params, RawRow, RawRowSink, RebuildNotifier,
    TableChangeMessage, TableIndexConnection, TableTruth, UserInfo,
};

// ---------------------------------------------------------------------------
// FakeIndex
// ---------------------------------------------------------------------------

#[derive(Default)]
struct IndexState {
    statements: Vec<(String, Params)>,
    columns: HashMap<i64, Vec<DatabaseColumnInfo>>,
    versions: HashMap<i64, i64>,
    hashes: HashMap<i64, String>,
    longs: Vec<(String, Option<i64>)>,
    long_lists: Vec<(String, Vec<i64>)>,
    rows: Vec<(String, Vec<RawRow>)>,
    failures: Vec<(String, String)>,
}

/// Index database that records statements and answers queries from canned
/// responses matched by SQL prefix. The per-table version and schema hash
/// rows are tracked for real.
#[derive(Default)]
pub(crate) struct FakeIndex {
    state: Mutex<IndexState>,
}

fn first_match<T: Clone>(entries: &[(String, T)], sql: &str) -> Option<T> {
    entries
        .iter()
        .rev()
        .find(|(prefix, _)| sql.starts_with(prefix.as_str()))
        .map(|(_, value)| value.clone())
}

/// Table id of a statement against a `T<id>S` status table.
fn status_table_id(sql: &str) -> Option<i64> {
    let rest = sql
        .strip_prefix("INSERT INTO T")
        .or_else(|| sql.strip_prefix("SELECT ROW_VERSION FROM T"))
        .or_else(|| sql.strip_prefix("SELECT SCHEMA_HASH FROM T"))?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    rest[digits.len()..].starts_with('S').then_some(())?;
    digits.parse().ok()
}

impl FakeIndex {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_columns(&self, table_id: i64, columns: Vec<DatabaseColumnInfo>) {
        self.state.lock().columns.insert(table_id, columns);
    }

    pub(crate) fn set_index_state(&self, table_id: i64, version: i64, schema_hash: &str) {
        let mut state = self.state.lock();
        state.versions.insert(table_id, version);
        state.hashes.insert(table_id, schema_hash.to_string());
    }

    pub(crate) fn index_version(&self, table_id: i64) -> Option<i64> {
        self.state.lock().versions.get(&table_id).copied()
    }

    pub(crate) fn index_schema_hash(&self, table_id: i64) -> Option<String> {
        self.state.lock().hashes.get(&table_id).cloned()
    }

    pub(crate) fn respond_long(&self, prefix: &str, value: Option<i64>) {
        self.state.lock().longs.push((prefix.to_string(), value));
    }

    pub(crate) fn respond_longs(&self, prefix: &str, values: Vec<i64>) {
        self.state.lock().long_lists.push((prefix.to_string(), values));
    }

    pub(crate) fn respond_rows(&self, prefix: &str, rows: Vec<RawRow>) {
        self.state.lock().rows.push((prefix.to_string(), rows));
    }

    /// Every statement starting with `prefix` fails with `message`.
    pub(crate) fn fail_on(&self, prefix: &str, message: &str) {
        self.state
            .lock()
            .failures
            .push((prefix.to_string(), message.to_string()));
    }

    /// SQL of every statement run so far, queries included, in order.
    pub(crate) fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .statements
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    pub(crate) fn executed(&self, sql: &str) -> bool {
        self.statements().iter().any(|s| s == sql)
    }

    pub(crate) fn executed_starting_with(&self, prefix: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.starts_with(prefix))
            .collect()
    }

    /// Parameters of the last statement starting with `prefix`.
    pub(crate) fn params_for(&self, prefix: &str) -> Option<Params> {
        self.state
            .lock()
            .statements
            .iter()
            .rev()
            .find(|(sql, _)| sql.starts_with(prefix))
            .map(|(_, params)| params.clone())
    }

    pub(crate) fn count_starting_with(&self, prefix: &str) -> usize {
        self.executed_starting_with(prefix).len()
    }

    fn record(&self, sql: &str, params: &Params) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.statements.push((sql.to_string(), params.clone()));
        match first_match(&state.failures, sql) {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TableIndexConnection for FakeIndex {
    async fn update(&self, sql: &str, params: &Params) -> anyhow::Result<u64> {
        self.record(sql, params)?;
        let mut state = self.state.lock();
        if let Some(table_id) = status_table_id(sql) {
            if let Some(DbValue::Long(version)) = params.get(VERSION_BIND) {
                state.versions.insert(table_id, *version);
                state
                    .hashes
                    .entry(table_id)
                    .or_insert_with(|| "DEFAULT".to_string());
            }
            if let Some(DbValue::String(hash)) = params.get(SCHEMA_HASH_BIND) {
                state.hashes.insert(table_id, hash.clone());
                state.versions.entry(table_id).or_insert(-1);
            }
        }
        Ok(1)
    }

    async fn update_batch(&self, sql: &str, batch: &[Params]) -> anyhow::Result<()> {
        for params in batch {
            self.record(sql, params)?;
        }
        Ok(())
    }

    async fn query_long(&self, sql: &str, params: &Params) -> anyhow::Result<Option<i64>> {
        self.record(sql, params)?;
        let state = self.state.lock();
        if let Some(table_id) = status_table_id(sql) {
            if sql == ddl::get_max_version_sql(table_id) {
                return Ok(state.versions.get(&table_id).copied());
            }
        }
        Ok(first_match(&state.longs, sql).flatten())
    }

    async fn query_longs(&self, sql: &str, params: &Params) -> anyhow::Result<Vec<i64>> {
        self.record(sql, params)?;
        Ok(first_match(&self.state.lock().long_lists, sql).unwrap_or_default())
    }

    async fn query_string(&self, sql: &str, params: &Params) -> anyhow::Result<Option<String>> {
        self.record(sql, params)?;
        let state = self.state.lock();
        Ok(status_table_id(sql)
            .filter(|id| sql == ddl::get_schema_hash_sql(*id))
            .and_then(|id| state.hashes.get(&id).cloned()))
    }

    async fn column_info(&self, table_id: i64) -> anyhow::Result<Vec<DatabaseColumnInfo>> {
        Ok(self
            .state
            .lock()
            .columns
            .get(&table_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn query_rows(
        &self,
        sql: &str,
        params: &Params,
        cancel: &CancellationToken,
        sink: &mut RawRowSink<'_>,
    ) -> anyhow::Result<()> {
        self.record(sql, params)?;
        let rows = first_match(&self.state.lock().rows, sql).unwrap_or_default();
        for row in rows {
            if cancel.is_cancelled() {
                anyhow::bail!("query cancelled");
            }
            sink(row)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeTruth
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TruthState {
    object_types: HashMap<i64, ObjectType>,
    schemas: HashMap<i64, Vec<ColumnModel>>,
    change_sets: HashMap<i64, Vec<ChangeSet>>,
    children: HashMap<i64, Vec<i64>>,
    annotations: Vec<ColumnModel>,
}

#[derive(Default)]
pub(crate) struct FakeTruth {
    state: Mutex<TruthState>,
}

impl FakeTruth {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn add_table(&self, table_id: i64, object_type: ObjectType, schema: Vec<ColumnModel>) {
        let mut state = self.state.lock();
        state.object_types.insert(table_id, object_type);
        state.schemas.insert(table_id, schema);
    }

    pub(crate) fn set_schema(&self, table_id: i64, schema: Vec<ColumnModel>) {
        self.state.lock().schemas.insert(table_id, schema);
    }

    pub(crate) fn remove_table(&self, table_id: i64) {
        self.state.lock().object_types.remove(&table_id);
    }

    pub(crate) fn append_change_set(&self, table_id: i64, change_set: ChangeSet) {
        self.state
            .lock()
            .change_sets
            .entry(table_id)
            .or_default()
            .push(change_set);
    }

    pub(crate) fn set_children(&self, container_id: i64, children: Vec<i64>) {
        self.state.lock().children.insert(container_id, children);
    }

    pub(crate) fn set_annotations(&self, annotations: Vec<ColumnModel>) {
        self.state.lock().annotations = annotations;
    }
}

#[async_trait]
impl TableTruth for FakeTruth {
    async fn object_type(&self, table_id: i64) -> anyhow::Result<Option<ObjectType>> {
        Ok(self.state.lock().object_types.get(&table_id).copied())
    }

    async fn column_models(&self, table_id: i64) -> anyhow::Result<Vec<ColumnModel>> {
        Ok(self
            .state
            .lock()
            .schemas
            .get(&table_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn last_change_version(&self, table_id: i64) -> anyhow::Result<Option<i64>> {
        Ok(self
            .state
            .lock()
            .change_sets
            .get(&table_id)
            .and_then(|sets| sets.last())
            .map(|set| set.version))
    }

    async fn change_sets_after(
        &self,
        table_id: i64,
        after_version: i64,
    ) -> anyhow::Result<Vec<ChangeSet>> {
        Ok(self
            .state
            .lock()
            .change_sets
            .get(&table_id)
            .map(|sets| {
                sets.iter()
                    .filter(|set| set.version > after_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn child_container_ids(&self, container_id: i64) -> anyhow::Result<Vec<i64>> {
        Ok(self
            .state
            .lock()
            .children
            .get(&container_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn annotation_columns(
        &self,
        _view_type: ViewTypeMask,
        _container_ids: &BTreeSet<i64>,
    ) -> anyhow::Result<Vec<ColumnModel>> {
        Ok(self.state.lock().annotations.clone())
    }
}

// ---------------------------------------------------------------------------
// Notifier and authorizer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    messages: Mutex<Vec<TableChangeMessage>>,
}

impl RecordingNotifier {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn messages(&self) -> Vec<TableChangeMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl RebuildNotifier for RecordingNotifier {
    async fn notify(&self, message: TableChangeMessage) -> anyhow::Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }
}

/// Grants the configured benefactors, or every benefactor when unset.
#[derive(Default)]
pub(crate) struct StaticAuthorizer {
    visible: Mutex<Option<BTreeSet<i64>>>,
}

impl StaticAuthorizer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_visible(&self, visible: impl IntoIterator<Item = i64>) {
        *self.visible.lock() = Some(visible.into_iter().collect());
    }
}

#[async_trait]
impl BenefactorAuthorizer for StaticAuthorizer {
    async fn accessible_benefactors(
        &self,
        _user: &UserInfo,
        benefactor_ids: &BTreeSet<i64>,
    ) -> anyhow::Result<BTreeSet<i64>> {
        Ok(match &*self.visible.lock() {
            Some(visible) => benefactor_ids.intersection(visible).copied().collect(),
            None => benefactor_ids.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Fakes wired into a [`TableContext`] with a manual clock at `1_000`.
pub(crate) struct Harness {
    pub(crate) index: Arc<FakeIndex>,
    pub(crate) truth: Arc<FakeTruth>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) authorizer: Arc<StaticAuthorizer>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) ctx: TableContext,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let index = FakeIndex::new();
        let truth = FakeTruth::new();
        let notifier = RecordingNotifier::new();
        let authorizer = StaticAuthorizer::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let ctx = TableContext::new(
            index.clone(),
            truth.clone(),
            notifier.clone(),
            authorizer.clone(),
        )
        .with_clock(clock.clone());
        Self {
            index,
            truth,
            notifier,
            authorizer,
            clock,
            ctx,
        }
    }
}
