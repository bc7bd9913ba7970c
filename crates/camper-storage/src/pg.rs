use async_trait::async_trait;
use camper_core::{Assignment, ColumnKind, ColumnValue, EntityType};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Connection, PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::{
    check_columns, EntityRow, EntityStore, MappingStore, PartnerMapping, Store, StoreError,
    StoreFactory, UserDirectory, UserRecord,
};

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgStoreFactory {
    pool: PgPool,
}

impl PgStoreFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StoreFactory for PgStoreFactory {
    async fn acquire(&self) -> Result<Box<dyn Store>, StoreError> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgStore { conn }))
    }
}

/// One pooled connection; it goes back to the pool when the store is dropped.
#[derive(Debug)]
pub struct PgStore {
    conn: PoolConnection<Postgres>,
}

impl PgStore {
    pub fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl MappingStore for PgStore {
    async fn resolve(
        &mut self,
        partner: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT internal_id
              FROM partner_mappings
             WHERE partner_name = $1
               AND entity_type = $2
               AND external_id = $3
            "#,
        )
        .bind(partner)
        .bind(entity_type.as_str())
        .bind(external_id)
        .fetch_optional(&mut *self.conn)
        .await?;
        Ok(id)
    }

    async fn register(
        &mut self,
        partner: &str,
        entity_type: EntityType,
        internal_id: i64,
        external_id: &str,
    ) -> Result<(), StoreError> {
        register_mapping(&mut self.conn, partner, entity_type, internal_id, external_id).await
    }

    async fn mappings_for(
        &mut self,
        partner: &str,
        entity_type: EntityType,
    ) -> Result<Vec<PartnerMapping>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT internal_id, external_id
              FROM partner_mappings
             WHERE partner_name = $1
               AND entity_type = $2
             ORDER BY internal_id
            "#,
        )
        .bind(partner)
        .bind(entity_type.as_str())
        .fetch_all(&mut *self.conn)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PartnerMapping {
                partner_name: partner.to_string(),
                entity_type,
                internal_id: row.try_get("internal_id")?,
                external_id: row.try_get("external_id")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn insert_entity(
        &mut self,
        entity_type: EntityType,
        row: &[Assignment],
    ) -> Result<i64, StoreError> {
        insert_row(&mut self.conn, entity_type, row).await
    }

    async fn update_entity(
        &mut self,
        entity_type: EntityType,
        id: i64,
        row: &[Assignment],
    ) -> Result<u64, StoreError> {
        check_columns(entity_type, row)?;
        if row.is_empty() {
            let exists = sqlx::query_scalar::<_, i64>(&format!(
                "SELECT id FROM {} WHERE id = $1",
                entity_type.table()
            ))
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
            return Ok(u64::from(exists.is_some()));
        }

        let mut qb = QueryBuilder::<Postgres>::new(format!("UPDATE {} SET ", entity_type.table()));
        for (idx, (column, value)) in row.iter().enumerate() {
            if idx > 0 {
                qb.push(", ");
            }
            qb.push(*column).push(" = ");
            push_value(&mut qb, entity_type, column, value.clone());
        }
        qb.push(" WHERE id = ").push_bind(id);

        let result = qb.build().execute(&mut *self.conn).await?;
        debug!(entity = %entity_type, id, columns = row.len(), "updated row");
        Ok(result.rows_affected())
    }

    async fn fetch_entity(
        &mut self,
        entity_type: EntityType,
        id: i64,
    ) -> Result<Option<EntityRow>, StoreError> {
        let row = sqlx::query(&format!("SELECT * FROM {} WHERE id = $1", entity_type.table()))
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.map(|row| decode_row(entity_type, &row)).transpose()
    }

    async fn count_entities(&mut self, entity_type: EntityType) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {}",
            entity_type.table()
        ))
        .fetch_one(&mut *self.conn)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn find_user(&mut self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query("SELECT id, email, role FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(UserRecord {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            role: row.try_get("role")?,
        }))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_mapped(
        &mut self,
        partner: &str,
        entity_type: EntityType,
        external_id: &str,
        row: &[Assignment],
    ) -> Result<i64, StoreError> {
        let mut tx = self.conn.begin().await?;
        let id = insert_row(&mut tx, entity_type, row).await?;
        register_mapping(&mut tx, partner, entity_type, id, external_id).await?;
        tx.commit().await?;
        Ok(id)
    }
}

async fn insert_row(
    conn: &mut PgConnection,
    entity_type: EntityType,
    row: &[Assignment],
) -> Result<i64, StoreError> {
    check_columns(entity_type, row)?;
    if row.is_empty() {
        let id = sqlx::query_scalar::<_, i64>(&format!(
            "INSERT INTO {} DEFAULT VALUES RETURNING id",
            entity_type.table()
        ))
        .fetch_one(&mut *conn)
        .await?;
        return Ok(id);
    }

    let columns = row.iter().map(|(column, _)| *column).collect::<Vec<_>>();
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "INSERT INTO {} ({}) VALUES (",
        entity_type.table(),
        columns.join(", ")
    ));
    for (idx, (column, value)) in row.iter().enumerate() {
        if idx > 0 {
            qb.push(", ");
        }
        push_value(&mut qb, entity_type, column, value.clone());
    }
    qb.push(") RETURNING id");

    let id: i64 = qb.build_query_scalar().fetch_one(&mut *conn).await?;
    debug!(entity = %entity_type, id, "inserted row");
    Ok(id)
}

async fn register_mapping(
    conn: &mut PgConnection,
    partner: &str,
    entity_type: EntityType,
    internal_id: i64,
    external_id: &str,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO partner_mappings (partner_name, entity_type, internal_id, external_id)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(partner)
    .bind(entity_type.as_str())
    .bind(internal_id)
    .bind(external_id)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            Err(StoreError::DuplicateMapping {
                partner: partner.to_string(),
                entity_type,
                external_id: external_id.to_string(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

// NULLs are bound with the column's own type so Postgres does not see them as text.
fn push_value(
    qb: &mut QueryBuilder<'_, Postgres>,
    entity_type: EntityType,
    column: &str,
    value: Option<ColumnValue>,
) {
    match value {
        Some(ColumnValue::Text(v)) => qb.push_bind(v),
        Some(ColumnValue::Bool(v)) => qb.push_bind(v),
        Some(ColumnValue::Int(v)) => qb.push_bind(v),
        Some(ColumnValue::Float(v)) => qb.push_bind(v),
        None => match entity_type.column_kind(column).unwrap_or(ColumnKind::Text) {
            ColumnKind::Text => qb.push_bind(None::<String>),
            ColumnKind::Bool => qb.push_bind(None::<bool>),
            ColumnKind::Int => qb.push_bind(None::<i64>),
            ColumnKind::Float => qb.push_bind(None::<f64>),
        },
    };
}

fn decode_row(entity_type: EntityType, row: &PgRow) -> Result<EntityRow, StoreError> {
    let mut out = EntityRow::new();
    out.insert("id".to_string(), Some(ColumnValue::Int(row.try_get("id")?)));

    let references = entity_type
        .reference_columns()
        .iter()
        .map(|name| (*name, ColumnKind::Int));
    let payload = entity_type
        .payload_columns()
        .iter()
        .map(|spec| (spec.name, spec.kind));

    for (column, kind) in references.chain(payload) {
        let value = match kind {
            ColumnKind::Text => row.try_get::<Option<String>, _>(column)?.map(ColumnValue::Text),
            ColumnKind::Bool => row.try_get::<Option<bool>, _>(column)?.map(ColumnValue::Bool),
            ColumnKind::Int => row.try_get::<Option<i64>, _>(column)?.map(ColumnValue::Int),
            ColumnKind::Float => row.try_get::<Option<f64>, _>(column)?.map(ColumnValue::Float),
        };
        out.insert(column.to_string(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn store_from_env() -> Option<PgStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let factory = PgStoreFactory::connect(&url, 1).await.unwrap();
        run_migrations(factory.pool()).await.unwrap();
        let conn = factory.pool().acquire().await.unwrap();
        Some(PgStore::new(conn))
    }

    async fn providers_named(store: &mut PgStore, name: &str) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM providers WHERE company_name = $1")
            .bind(name)
            .fetch_one(&mut *store.conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a scratch Postgres"]
    async fn duplicate_mapping_rolls_back_the_inserted_row() {
        let Some(mut store) = store_from_env().await else {
            return;
        };
        let partner = format!("test-{}", Uuid::new_v4());
        let name = format!("Acme RV {partner}");
        let row = vec![("company_name", Some(ColumnValue::Text(name.clone())))];

        let id = store
            .insert_mapped(&partner, EntityType::Provider, "42", &row)
            .await
            .unwrap();
        assert_eq!(
            store.resolve(&partner, EntityType::Provider, "42").await.unwrap(),
            Some(id)
        );
        assert_eq!(providers_named(&mut store, &name).await, 1);

        let err = store
            .insert_mapped(&partner, EntityType::Provider, "42", &row)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateMapping { .. }));
        assert_eq!(providers_named(&mut store, &name).await, 1);
        assert_eq!(store.mappings_for(&partner, EntityType::Provider).await.unwrap().len(), 1);
    }
}
