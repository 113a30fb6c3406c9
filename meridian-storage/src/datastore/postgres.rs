//! PostgreSQL datastore backed by a deadpool connection pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Object, Pool, PoolError};
use meridian_core::{StorageError, StorageResult};
use serde_json::Value;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::Row;

use super::{Datastore, DatastoreConnection, Record, StoreRole};
use crate::config::DbConfig;

/// Map a driver error onto the storage taxonomy.
///
/// SQLSTATE class 23 (integrity constraint violation) becomes
/// [`StorageError::ConstraintViolation`]; a closed connection becomes
/// [`StorageError::Connection`].
pub fn map_pg_error(role: StoreRole, err: tokio_postgres::Error) -> StorageError {
    if let Some(db) = err.as_db_error() {
        if db.code().code().starts_with("23") {
            return StorageError::ConstraintViolation {
                constraint: db
                    .constraint()
                    .or(db.table())
                    .unwrap_or("unknown")
                    .to_string(),
                reason: db.message().to_string(),
            };
        }
        return StorageError::Query {
            reason: db.message().to_string(),
        };
    }
    if err.is_closed() {
        return StorageError::Connection {
            store: role.to_string(),
            reason: err.to_string(),
        };
    }
    StorageError::Query {
        reason: err.to_string(),
    }
}

pub fn map_pool_error(err: PoolError) -> StorageError {
    StorageError::Pool {
        reason: err.to_string(),
    }
}

/// One of the two production stores.
#[derive(Clone)]
pub struct PgDatastore {
    role: StoreRole,
    pool: Pool,
}

impl PgDatastore {
    pub fn new(role: StoreRole, pool: Pool) -> Self {
        Self { role, pool }
    }

    pub fn from_config(role: StoreRole, config: &DbConfig) -> StorageResult<Self> {
        Ok(Self::new(role, config.create_pool()?))
    }

    /// Current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }
}

#[async_trait]
impl Datastore for PgDatastore {
    fn role(&self) -> StoreRole {
        self.role
    }

    async fn acquire(&self) -> StorageResult<Box<dyn DatastoreConnection>> {
        let client = self.pool.get().await.map_err(map_pool_error)?;
        if let Err(err) = client.batch_execute("BEGIN").await {
            let _ = Object::take(client);
            return Err(map_pg_error(self.role, err));
        }
        Ok(Box::new(PgConnection {
            role: self.role,
            client: Some(client),
            open: true,
        }))
    }
}

/// Pooled connection with an open transaction.
pub struct PgConnection {
    role: StoreRole,
    client: Option<Object>,
    open: bool,
}

impl PgConnection {
    fn client(&self) -> StorageResult<&Object> {
        match (&self.client, self.open) {
            (Some(client), true) => Ok(client),
            _ => Err(StorageError::TransactionClosed),
        }
    }

    async fn finish(&mut self, statement: &str) -> StorageResult<()> {
        let role = self.role;
        let result = self.client()?.batch_execute(statement).await;
        self.open = false;
        result.map_err(|err| map_pg_error(role, err))
    }
}

type SqlParam = Box<dyn ToSql + Sync + Send>;

fn bind_error(position: usize, ty: &Type, value: &Value) -> StorageError {
    StorageError::Bind {
        position,
        reason: format!("{} does not fit {}", value, ty),
    }
}

/// Convert `value` to the Rust type the server expects for `ty`.
///
/// The driver checks parameter types strictly, so an integer bound for an
/// `int4` column has to be an `i32`, not an `i64`.
fn to_sql_param(position: usize, value: &Value, ty: &Type) -> StorageResult<SqlParam> {
    let param: SqlParam = match value {
        Value::Null => null_param(ty),
        Value::Bool(v) if *ty == Type::BOOL => Box::new(*v),
        Value::Number(n) if *ty == Type::INT2 => {
            let v = n.as_i64().and_then(|v| i16::try_from(v).ok());
            Box::new(v.ok_or_else(|| bind_error(position, ty, value))?)
        }
        Value::Number(n) if *ty == Type::INT4 => {
            let v = n.as_i64().and_then(|v| i32::try_from(v).ok());
            Box::new(v.ok_or_else(|| bind_error(position, ty, value))?)
        }
        Value::Number(n) if *ty == Type::INT8 => {
            Box::new(n.as_i64().ok_or_else(|| bind_error(position, ty, value))?)
        }
        Value::Number(n) if *ty == Type::FLOAT4 => {
            Box::new(n.as_f64().ok_or_else(|| bind_error(position, ty, value))? as f32)
        }
        Value::Number(n) if *ty == Type::FLOAT8 => {
            Box::new(n.as_f64().ok_or_else(|| bind_error(position, ty, value))?)
        }
        Value::String(v) if *ty == Type::TIMESTAMPTZ => {
            let at = DateTime::parse_from_rfc3339(v)
                .map_err(|err| StorageError::Bind {
                    position,
                    reason: err.to_string(),
                })?
                .with_timezone(&Utc);
            Box::new(at)
        }
        other if *ty == Type::JSON || *ty == Type::JSONB => Box::new(other.clone()),
        Value::String(v) if is_textual(ty) => Box::new(v.clone()),
        Value::Bool(_) | Value::Number(_) if is_textual(ty) => Box::new(value.to_string()),
        _ => return Err(bind_error(position, ty, value)),
    };
    Ok(param)
}

fn null_param(ty: &Type) -> SqlParam {
    if *ty == Type::BOOL {
        Box::new(Option::<bool>::None)
    } else if *ty == Type::INT2 {
        Box::new(Option::<i16>::None)
    } else if *ty == Type::INT4 {
        Box::new(Option::<i32>::None)
    } else if *ty == Type::INT8 {
        Box::new(Option::<i64>::None)
    } else if *ty == Type::FLOAT4 {
        Box::new(Option::<f32>::None)
    } else if *ty == Type::FLOAT8 {
        Box::new(Option::<f64>::None)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        Box::new(Option::<Value>::None)
    } else if *ty == Type::TIMESTAMPTZ {
        Box::new(Option::<DateTime<Utc>>::None)
    } else {
        Box::new(Option::<String>::None)
    }
}

fn is_textual(ty: &Type) -> bool {
    *ty == Type::TEXT
        || *ty == Type::VARCHAR
        || *ty == Type::BPCHAR
        || *ty == Type::NAME
        || *ty == Type::UNKNOWN
}

fn bind_params(types: &[Type], params: &[Value]) -> StorageResult<Vec<SqlParam>> {
    if types.len() != params.len() {
        return Err(StorageError::Bind {
            position: params.len(),
            reason: format!("statement expects {} parameters", types.len()),
        });
    }
    types
        .iter()
        .zip(params)
        .enumerate()
        .map(|(idx, (ty, value))| to_sql_param(idx + 1, value, ty))
        .collect()
}

fn decode_column(row: &Row, idx: usize, ty: &Type) -> Result<Value, tokio_postgres::Error> {
    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::from)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(Value::from)
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(Value::from)
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::from)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::from(f64::from(v)))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(Value::from)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<Value>>(idx)?
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| Value::from(v.to_rfc3339()))
    } else {
        row.try_get::<_, Option<String>>(idx)?.map(Value::from)
    };
    Ok(value.unwrap_or(Value::Null))
}

fn row_to_record(row: &Row) -> StorageResult<Record> {
    let mut record = Record::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, idx, column.type_()).map_err(|err| StorageError::Decode {
            column: column.name().to_string(),
            reason: err.to_string(),
        })?;
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

#[async_trait]
impl DatastoreConnection for PgConnection {
    fn role(&self) -> StoreRole {
        self.role
    }

    async fn query(&mut self, statement: &str, params: &[Value]) -> StorageResult<Vec<Record>> {
        let role = self.role;
        let client = self.client()?;
        let prepared = client
            .prepare_cached(statement)
            .await
            .map_err(|err| map_pg_error(role, err))?;
        let bound = bind_params(prepared.params(), params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let rows = client
            .query(&prepared, &refs)
            .await
            .map_err(|err| map_pg_error(role, err))?;
        rows.iter().map(row_to_record).collect()
    }

    async fn execute(&mut self, statement: &str, params: &[Value]) -> StorageResult<u64> {
        let role = self.role;
        let client = self.client()?;
        let prepared = client
            .prepare_cached(statement)
            .await
            .map_err(|err| map_pg_error(role, err))?;
        let bound = bind_params(prepared.params(), params)?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect();
        client
            .execute(&prepared, &refs)
            .await
            .map_err(|err| map_pg_error(role, err))
    }

    async fn commit(&mut self) -> StorageResult<()> {
        let role = self.role;
        self.finish("COMMIT")
            .await
            .map_err(|err| StorageError::CommitFailed {
                store: role.to_string(),
                reason: err.to_string(),
            })
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        let role = self.role;
        self.finish("ROLLBACK")
            .await
            .map_err(|err| StorageError::RollbackFailed {
                store: role.to_string(),
                reason: err.to_string(),
            })
    }

    fn is_closed(&self) -> bool {
        !self.open
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if self.open {
            if let Some(client) = self.client.take() {
                // An open transaction must never be recycled into the pool.
                tracing::warn!(store = %self.role, "Dropping connection with open transaction; detaching from pool");
                let _ = Object::take(client);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debug(param: StorageResult<SqlParam>) -> String {
        param.map(|p| format!("{:?}", p)).unwrap_or_else(|e| e.to_string())
    }

    #[test]
    fn test_integers_follow_column_width() {
        assert_eq!(debug(to_sql_param(1, &Value::from(42), &Type::INT4)), "42");
        assert_eq!(debug(to_sql_param(1, &Value::from(42), &Type::FLOAT8)), "42.0");
        assert_eq!(debug(to_sql_param(1, &Value::from(7), &Type::TEXT)), "\"7\"");
    }

    #[test]
    fn test_out_of_range_integer_is_rejected() {
        let err = to_sql_param(2, &Value::from(70_000), &Type::INT2).err();
        assert!(matches!(err, Some(StorageError::Bind { position: 2, .. })));
        let err = to_sql_param(1, &Value::from("many"), &Type::INT4).err();
        assert!(matches!(err, Some(StorageError::Bind { position: 1, .. })));
    }

    #[test]
    fn test_null_param_is_none() {
        assert_eq!(debug(to_sql_param(1, &Value::Null, &Type::INT4)), "None");
        assert_eq!(debug(to_sql_param(1, &Value::Null, &Type::TEXT)), "None");
    }

    #[test]
    fn test_timestamps_are_parsed() {
        let param = debug(to_sql_param(
            1,
            &Value::from("2026-03-01T12:00:00Z"),
            &Type::TIMESTAMPTZ,
        ));
        assert!(param.starts_with("2026-03-01T12:00:00"));
    }

    #[test]
    fn test_parameter_count_must_match() {
        let err = bind_params(&[Type::INT4], &[]).err();
        assert!(matches!(err, Some(StorageError::Bind { .. })));
    }
}
