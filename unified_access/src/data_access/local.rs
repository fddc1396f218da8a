//! Manager for models stored by this service
//!
//! Records of every local model live in the shared `records` table, keyed by
//! `(model_name, id)`, with attributes as a JSON document. All statements are
//! scoped to the model and, unless the caller is a superuser, to the caller's
//! tenant. Mutations run in a single transaction and publish a change event
//! once it has committed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::{Action, RequestContext};
use crate::config::PaginationConfig;
use crate::data_access::cursor::Cursor;
use crate::data_access::hooks::{changes, DefaultHooks, ManagerHooks};
use crate::data_access::DataAccess;
use crate::db::WriteTransaction;
use crate::error::{Error, Result};
use crate::models::filter::{Direction, ListFilter, ListQuery};
use crate::models::record::{format_timestamp, now, Attributes, PaginatedResponse, Record};
use crate::models::registry::ModelInfo;
use crate::notify::{ChangeBroadcaster, ChangeEvent, ChangeEventType};

const SELECT_RECORD: &str =
    "SELECT id, tenant_id, lsn, created_at, updated_at, attributes FROM records";

#[derive(Debug, FromRow)]
struct RecordRow {
    id: String,
    tenant_id: String,
    lsn: i64,
    created_at: String,
    updated_at: String,
    attributes: String,
}

impl RecordRow {
    fn into_record(self) -> Result<Record> {
        Ok(Record {
            id: parse_uuid(&self.id)?,
            lsn: self.lsn,
            tenant_id: parse_uuid(&self.tenant_id)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            attributes: serde_json::from_str(&self.attributes)?,
        })
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("corrupt id '{}': {}", value, e)))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("corrupt timestamp '{}': {}", value, e)))
}

/// SQL expression reading an attribute; `field` must be a validated identifier
fn attribute_expression(field: &str) -> String {
    format!("json_extract(attributes, '$.{}')", field)
}

fn sort_expression(field: &str) -> String {
    match field {
        "created_at" | "updated_at" => field.to_string(),
        other => attribute_expression(other),
    }
}

/// Bind a JSON value so SQLite compares it the way `json_extract` returns it
fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => {
            builder.push("NULL");
        }
        Value::Bool(b) => {
            builder.push_bind(*b);
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => {
                builder.push_bind(i);
            }
            None => {
                builder.push_bind(n.as_f64().unwrap_or(f64::NAN));
            }
        },
        Value::String(s) => {
            builder.push_bind(s.clone());
        }
        other => {
            builder.push_bind(other.to_string());
        }
    }
}

/// Restrict to rows after `cursor` in `(sort, id)` order. SQLite sorts NULL
/// before every value, so NULL positions need their own predicates.
fn push_keyset(
    builder: &mut QueryBuilder<'_, Sqlite>,
    sort: &str,
    direction: Direction,
    cursor: &Cursor,
) {
    let op = match direction {
        Direction::Asc => ">",
        Direction::Desc => "<",
    };

    if cursor.value.is_null() {
        builder.push(format_args!(" AND (({} IS NULL AND id {} ", sort, op));
        builder.push_bind(cursor.id.to_string()).push(")");
        if direction == Direction::Asc {
            builder.push(format_args!(" OR {} IS NOT NULL", sort));
        }
        builder.push(")");
        return;
    }

    builder.push(format_args!(" AND ({} {} ", sort, op));
    push_value(builder, &cursor.value);
    builder.push(format_args!(" OR ({} = ", sort));
    push_value(builder, &cursor.value);
    builder
        .push(format_args!(" AND id {} ", op))
        .push_bind(cursor.id.to_string())
        .push(")");
    if direction == Direction::Desc {
        builder.push(format_args!(" OR {} IS NULL", sort));
    }
    builder.push(")");
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

async fn fetch_record<'e, E>(
    executor: E,
    model: &str,
    id: Uuid,
    scope: Option<Uuid>,
) -> Result<Option<Record>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let mut builder = QueryBuilder::<Sqlite>::new(SELECT_RECORD);
    builder
        .push(" WHERE model_name = ")
        .push_bind(model.to_string())
        .push(" AND id = ")
        .push_bind(id.to_string());
    if let Some(tenant_id) = scope {
        builder.push(" AND tenant_id = ").push_bind(tenant_id.to_string());
    }

    builder
        .build_query_as::<RecordRow>()
        .fetch_optional(executor)
        .await?
        .map(RecordRow::into_record)
        .transpose()
}

/// CRUD against the local record store
pub struct LocalManager {
    info: Arc<ModelInfo>,
    pool: SqlitePool,
    hooks: Arc<dyn ManagerHooks>,
    notifier: Arc<ChangeBroadcaster>,
    context: RequestContext,
    pagination: PaginationConfig,
}

impl LocalManager {
    pub fn new(
        info: Arc<ModelInfo>,
        pool: SqlitePool,
        notifier: Arc<ChangeBroadcaster>,
        context: RequestContext,
        pagination: PaginationConfig,
    ) -> Self {
        let hooks = info
            .hooks
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultHooks) as Arc<dyn ManagerHooks>);
        Self {
            info,
            pool,
            hooks,
            notifier,
            context,
            pagination,
        }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Tenant the caller is confined to; `None` lets a superuser see every tenant
    fn tenant_scope(&self) -> Result<Option<Uuid>> {
        let principal = &self.context.principal;
        if principal.is_superuser {
            return Ok(None);
        }
        principal.tenant_id.map(Some).ok_or_else(|| {
            Error::PermissionDenied("principal is not attached to a tenant".to_string())
        })
    }

    fn page_limit(&self, requested: Option<u32>) -> Result<u32> {
        match requested {
            None => Ok(self.pagination.default_page_size),
            Some(limit) if limit == 0 || limit > self.pagination.max_page_size => {
                Err(Error::Validation(format!(
                    "limit must be between 1 and {}",
                    self.pagination.max_page_size
                )))
            }
            Some(limit) => Ok(limit),
        }
    }

    fn not_found(&self, id: Uuid) -> Error {
        Error::NotFound {
            model: self.info.name.clone(),
            id,
        }
    }

    fn conflict(&self, id: Uuid, expected: i64, actual: i64) -> Error {
        Error::Conflict {
            model: self.info.name.clone(),
            id,
            expected,
            actual,
        }
    }

    fn publish(&self, event_type: ChangeEventType, id: Uuid, lsn: i64, tenant_id: Uuid) {
        self.notifier.publish(&ChangeEvent::new(
            event_type,
            &self.info.name,
            id,
            lsn,
            tenant_id,
        ));
    }

    fn push_filter(&self, builder: &mut QueryBuilder<'_, Sqlite>, filter: &ListFilter) -> Result<()> {
        for (field, value) in &filter.eq {
            if !self.info.filter.filterable.contains(field) {
                return Err(Error::Validation(format!(
                    "{}.{} is not filterable",
                    self.info.name, field
                )));
            }
            let expression = attribute_expression(field);
            if value.is_null() {
                builder.push(format_args!(" AND {} IS NULL", expression));
            } else {
                builder.push(format_args!(" AND {} = ", expression));
                push_value(builder, value);
            }
        }

        if let Some(ids) = &filter.id_in {
            if ids.is_empty() {
                builder.push(" AND 0");
            } else {
                builder.push(" AND id IN (");
                let mut separated = builder.separated(", ");
                for id in ids {
                    separated.push_bind(id.to_string());
                }
                separated.push_unseparated(")");
            }
        }

        for (column, op, bound) in [
            ("created_at", ">=", &filter.created_at_gte),
            ("created_at", "<", &filter.created_at_lt),
            ("updated_at", ">=", &filter.updated_at_gte),
            ("updated_at", "<", &filter.updated_at_lt),
        ] {
            if let Some(ts) = bound {
                builder
                    .push(format_args!(" AND {} {} ", column, op))
                    .push_bind(format_timestamp(ts));
            }
        }

        if let Some(term) = filter.search.as_deref().filter(|t| !t.is_empty()) {
            let searchable = &self.info.filter.searchable;
            if searchable.is_empty() {
                return Err(Error::Validation(format!(
                    "{} has no searchable fields",
                    self.info.name
                )));
            }
            let pattern = format!("%{}%", escape_like(&term.to_lowercase()));
            builder.push(" AND (");
            for (i, field) in searchable.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                builder
                    .push(format_args!("lower({}) LIKE ", attribute_expression(field)))
                    .push_bind(pattern.clone())
                    .push(" ESCAPE '\\'");
            }
            builder.push(")");
        }

        Ok(())
    }

    /// Local reference targets must exist in the record's tenant
    async fn check_references(
        &self,
        conn: &mut SqliteConnection,
        tenant_id: Uuid,
        values: &Attributes,
    ) -> Result<()> {
        for relation in self.info.relations.iter().filter(|r| r.target_is_local) {
            let Some(raw) = values.get(&relation.field).and_then(Value::as_str) else {
                continue;
            };
            let target = Uuid::parse_str(raw).map_err(|_| {
                Error::Validation(format!("{}.{} must be a UUID", self.info.name, relation.field))
            })?;

            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT 1 FROM records WHERE model_name = ? AND id = ? AND tenant_id = ?",
            )
            .bind(&relation.target)
            .bind(target.to_string())
            .bind(tenant_id.to_string())
            .fetch_optional(&mut *conn)
            .await?
            .is_some();

            if !exists {
                return Err(Error::Validation(format!(
                    "{}.{} references unknown {} {}",
                    self.info.name, relation.field, relation.target, target
                )));
            }
        }
        Ok(())
    }

    async fn current_lsn(&self, conn: &mut SqliteConnection, id: Uuid) -> Result<Option<i64>> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT lsn FROM records WHERE model_name = ? AND id = ?")
                .bind(&self.info.name)
                .bind(id.to_string())
                .fetch_optional(&mut *conn)
                .await?,
        )
    }

    async fn insert_record(&self, conn: &mut SqliteConnection, record: &Record) -> Result<()> {
        self.check_references(conn, record.tenant_id, &record.attributes)
            .await?;
        sqlx::query(
            "INSERT INTO records (model_name, id, tenant_id, lsn, created_at, updated_at, attributes)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.info.name)
        .bind(record.id.to_string())
        .bind(record.tenant_id.to_string())
        .bind(record.lsn)
        .bind(format_timestamp(&record.created_at))
        .bind(format_timestamp(&record.updated_at))
        .bind(serde_json::to_string(&record.attributes)?)
        .execute(&mut *conn)
        .await
        .map_err(|e| self.hooks.translate_integrity_error(&self.info, e))?;
        Ok(())
    }

    /// Apply `payload` on top of the stored record. The flag is false when
    /// nothing would change, in which case the stored record comes back as is.
    async fn apply_update(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        scope: Option<Uuid>,
        mut payload: Attributes,
        expected_lsn: Option<i64>,
    ) -> Result<(Record, bool)> {
        let current = fetch_record(&mut *conn, &self.info.name, id, scope)
            .await?
            .ok_or_else(|| self.not_found(id))?;

        if let Some(expected) = expected_lsn {
            if expected != current.lsn {
                return Err(self.conflict(id, expected, current.lsn));
            }
        }

        self.hooks
            .prepare_update(&self.info, &self.context, &current, &mut payload)?;
        self.info.schema.validate_update(&self.info.name, &payload)?;

        let changed: Attributes = payload
            .into_iter()
            .filter(|(field, value)| changes(&current.attributes, field, value))
            .collect();
        if changed.is_empty() {
            return Ok((current, false));
        }
        self.check_references(conn, current.tenant_id, &changed)
            .await?;

        let mut record = current.clone();
        record.attributes.extend(changed);
        record.lsn = current.lsn + 1;
        record.updated_at = now();

        let result = sqlx::query(
            "UPDATE records SET attributes = ?, lsn = lsn + 1, updated_at = ?
             WHERE model_name = ? AND id = ? AND lsn = ?",
        )
        .bind(serde_json::to_string(&record.attributes)?)
        .bind(format_timestamp(&record.updated_at))
        .bind(&self.info.name)
        .bind(id.to_string())
        .bind(current.lsn)
        .execute(&mut *conn)
        .await
        .map_err(|e| self.hooks.translate_integrity_error(&self.info, e))?;

        if result.rows_affected() == 0 {
            // A concurrent writer got there first
            return Err(match self.current_lsn(conn, id).await? {
                Some(actual) => self.conflict(id, current.lsn, actual),
                None => self.not_found(id),
            });
        }
        Ok((record, true))
    }

    /// Delete the record, returning it as it was
    async fn remove_record(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        scope: Option<Uuid>,
    ) -> Result<Record> {
        let current = fetch_record(&mut *conn, &self.info.name, id, scope)
            .await?
            .ok_or_else(|| self.not_found(id))?;
        self.hooks
            .prepare_delete(&self.info, &self.context, &current)?;

        let result =
            sqlx::query("DELETE FROM records WHERE model_name = ? AND id = ? AND lsn = ?")
                .bind(&self.info.name)
                .bind(id.to_string())
                .bind(current.lsn)
                .execute(&mut *conn)
                .await
                .map_err(|e| self.hooks.translate_integrity_error(&self.info, e))?;

        if result.rows_affected() == 0 {
            return Err(match self.current_lsn(conn, id).await? {
                Some(actual) => self.conflict(id, current.lsn, actual),
                None => self.not_found(id),
            });
        }
        Ok(current)
    }
}

#[async_trait]
impl DataAccess for LocalManager {
    fn model_name(&self) -> &str {
        &self.info.name
    }

    async fn list(&self, query: ListQuery) -> Result<PaginatedResponse> {
        self.context.principal.require(&self.info.name, Action::Read)?;
        let scope = self.tenant_scope()?;
        let limit = self.page_limit(query.limit)?;
        let order = query.order;

        if !self.info.filter.can_sort_by(&order.field) {
            return Err(Error::Validation(format!(
                "{} cannot be ordered by '{}'",
                self.info.name, order.field
            )));
        }
        let cursor = query
            .cursor
            .as_deref()
            .map(|token| Cursor::decode(token, &order))
            .transpose()?;

        let sort = sort_expression(&order.field);
        let direction = match order.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };

        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_RECORD);
        builder
            .push(" WHERE model_name = ")
            .push_bind(self.info.name.clone());
        if let Some(tenant_id) = scope {
            builder.push(" AND tenant_id = ").push_bind(tenant_id.to_string());
        }
        self.push_filter(&mut builder, &query.filter)?;

        if let Some(cursor) = &cursor {
            push_keyset(&mut builder, &sort, order.direction, cursor);
        }

        builder
            .push(format_args!(
                " ORDER BY {} {}, id {} LIMIT ",
                sort, direction, direction
            ))
            .push_bind(i64::from(limit) + 1);

        let mut items = builder
            .build_query_as::<RecordRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(RecordRow::into_record)
            .collect::<Result<Vec<_>>>()?;

        let has_more = items.len() > limit as usize;
        items.truncate(limit as usize);
        let next_cursor = match items.last() {
            Some(last) if has_more => Some(Cursor::after(last, &order).encode()?),
            _ => None,
        };

        tracing::debug!(
            model = %self.info.name,
            count = items.len(),
            has_more,
            "Listed records"
        );

        Ok(PaginatedResponse {
            count: items.len(),
            items,
            next_cursor,
            limit,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Record> {
        self.context.principal.require(&self.info.name, Action::Read)?;
        let scope = self.tenant_scope()?;

        fetch_record(&self.pool, &self.info.name, id, scope)
            .await?
            .ok_or_else(|| self.not_found(id))
    }

    async fn create(&self, mut payload: Attributes) -> Result<Record> {
        let principal = &self.context.principal;
        principal.require(&self.info.name, Action::Create)?;
        let tenant_id = principal.tenant_id.ok_or_else(|| {
            Error::PermissionDenied(format!("creating {} requires a tenant", self.info.name))
        })?;

        self.hooks
            .prepare_create(&self.info, &self.context, &mut payload)?;
        self.info.schema.validate_create(&self.info.name, &payload)?;

        let ts = now();
        let record = Record {
            id: Uuid::new_v4(),
            lsn: 1,
            tenant_id,
            created_at: ts,
            updated_at: ts,
            attributes: payload,
        };

        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let inserted = self.insert_record(&mut tx, &record).await;
        tx.finish(inserted).await?;

        tracing::debug!(model = %self.info.name, id = %record.id, "Record created");
        self.publish(ChangeEventType::Created, record.id, record.lsn, tenant_id);
        Ok(record)
    }

    async fn update(
        &self,
        id: Uuid,
        payload: Attributes,
        expected_lsn: Option<i64>,
    ) -> Result<Record> {
        self.context.principal.require(&self.info.name, Action::Update)?;
        let scope = self.tenant_scope()?;

        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let applied = self
            .apply_update(&mut tx, id, scope, payload, expected_lsn)
            .await;
        let (record, changed) = tx.finish(applied).await?;
        if !changed {
            tracing::debug!(model = %self.info.name, %id, "Update changes nothing");
            return Ok(record);
        }

        tracing::debug!(model = %self.info.name, %id, lsn = record.lsn, "Record updated");
        self.publish(ChangeEventType::Updated, id, record.lsn, record.tenant_id);
        Ok(record)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.context.principal.require(&self.info.name, Action::Delete)?;
        let scope = self.tenant_scope()?;

        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let removed = self.remove_record(&mut tx, id, scope).await;
        let current = tx.finish(removed).await?;

        tracing::debug!(model = %self.info.name, %id, "Record deleted");
        // Deletion is the record's last mutation
        self.publish(ChangeEventType::Deleted, id, current.lsn + 1, current.tenant_id);
        Ok(())
    }
}
