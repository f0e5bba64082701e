//! PostgreSQL implementation of DeliveryStore
//!
//! Production persistence using PostgreSQL with:
//! - Conditional `queued_at` update for at-most-once admission
//! - `ON CONFLICT DO NOTHING` get-or-create for attempt rows
//! - Atomic attempt increments guarded against terminal rows

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{DeliveryAttempt, DeliveryStatus, Event, Registration, Shop};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;

const REGISTRATION_COLUMNS: &str =
    "id, shop_id, target_url, event_types, secret, active, created_at";
const EVENT_COLUMNS: &str = "id, shop_id, event_type, payload, created_at, queued_at";
const ATTEMPT_COLUMNS: &str = "id, event_id, webhook_registration_id, status, attempts, \
     last_attempt_at, next_retry_at, response_code, response_body, created_at";

/// PostgreSQL implementation of DeliveryStore
///
/// # Example
///
/// ```ignore
/// use courier_delivery::PostgresDeliveryStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/courier").await?;
/// let store = PostgresDeliveryStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresDeliveryStore {
    pool: PgPool,
}

impl PostgresDeliveryStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("{}: {}", context, e);
        StoreError::Database(e.to_string())
    }
}

fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|code| code == "23503")
}

fn shop_from_row(row: &PgRow) -> Shop {
    Shop {
        id: row.get("id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    }
}

fn registration_from_row(row: &PgRow) -> Registration {
    Registration {
        id: row.get("id"),
        shop_id: row.get("shop_id"),
        target_url: row.get("target_url"),
        event_types: row.get("event_types"),
        secret: row.get("secret"),
        active: row.get("active"),
        created_at: row.get("created_at"),
    }
}

fn event_from_row(row: &PgRow) -> Event {
    Event {
        id: row.get("id"),
        shop_id: row.get("shop_id"),
        event_type: row.get("event_type"),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
        queued_at: row.get("queued_at"),
    }
}

fn attempt_from_row(row: &PgRow) -> Result<DeliveryAttempt, StoreError> {
    let status: String = row.get("status");
    let status: DeliveryStatus = status
        .parse()
        .map_err(|e: courier_core::ParseDeliveryStatusError| {
            StoreError::Serialization(e.to_string())
        })?;
    let response_code = row
        .get::<Option<i32>, _>("response_code")
        .map(|c| u16::try_from(c).map_err(|e| StoreError::Serialization(e.to_string())))
        .transpose()?;

    Ok(DeliveryAttempt {
        id: row.get("id"),
        event_id: row.get("event_id"),
        registration_id: row.get("webhook_registration_id"),
        status,
        attempts: row.get::<i32, _>("attempts").max(0) as u32,
        last_attempt_at: row.get("last_attempt_at"),
        next_retry_at: row.get("next_retry_at"),
        response_code,
        response_body: row.get("response_body"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    #[instrument(skip(self))]
    async fn create_shop(&self, name: &str) -> Result<Shop, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO shops (id, name)
            VALUES ($1, $2)
            RETURNING id, name, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create shop"))?;

        Ok(shop_from_row(&row))
    }

    async fn get_shop(&self, shop_id: Uuid) -> Result<Option<Shop>, StoreError> {
        let row = sqlx::query("SELECT id, name, created_at FROM shops WHERE id = $1")
            .bind(shop_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to get shop"))?;

        Ok(row.as_ref().map(shop_from_row))
    }

    async fn list_shops(&self) -> Result<Vec<Shop>, StoreError> {
        let rows = sqlx::query("SELECT id, name, created_at FROM shops ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list shops"))?;

        Ok(rows.iter().map(shop_from_row).collect())
    }

    #[instrument(skip(self, registration), fields(shop_id = %registration.shop_id))]
    async fn create_registration(
        &self,
        registration: NewRegistration,
    ) -> Result<Registration, StoreError> {
        let shop_id = registration.shop_id;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO webhook_registrations (id, shop_id, target_url, event_types, secret, active)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {REGISTRATION_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(shop_id)
        .bind(&registration.target_url)
        .bind(&registration.event_types)
        .bind(&registration.secret)
        .bind(registration.active)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                StoreError::ShopNotFound(shop_id)
            } else {
                error!("Failed to create registration: {}", e);
                StoreError::Database(e.to_string())
            }
        })?;

        Ok(registration_from_row(&row))
    }

    async fn get_registration(
        &self,
        registration_id: Uuid,
    ) -> Result<Option<Registration>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM webhook_registrations WHERE id = $1"
        ))
        .bind(registration_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get registration"))?;

        Ok(row.as_ref().map(registration_from_row))
    }

    async fn list_registrations(&self, shop_id: Uuid) -> Result<Vec<Registration>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {REGISTRATION_COLUMNS}
            FROM webhook_registrations
            WHERE shop_id = $1
            ORDER BY created_at, id
            "#
        ))
        .bind(shop_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list registrations"))?;

        Ok(rows.iter().map(registration_from_row).collect())
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn insert_events(&self, events: Vec<NewEvent>) -> Result<Vec<Event>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let mut created = Vec::with_capacity(events.len());
        for new_event in events {
            let shop_id = new_event.shop_id;
            let event = Event::new(shop_id, new_event.event_type, new_event.payload);
            sqlx::query(
                r#"
                INSERT INTO events (id, shop_id, event_type, payload, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(event.id)
            .bind(event.shop_id)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(event.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    StoreError::ShopNotFound(shop_id)
                } else {
                    error!("Failed to insert event: {}", e);
                    StoreError::Database(e.to_string())
                }
            })?;
            created.push(event);
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit events"))?;

        debug!(count = created.len(), "inserted events");
        Ok(created)
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to get event"))?;

        Ok(row.as_ref().map(event_from_row))
    }

    async fn shops_with_unadmitted_events(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT shop_id
            FROM events
            WHERE queued_at IS NULL
            ORDER BY shop_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list shops with unadmitted events"))?;

        Ok(rows.iter().map(|r| r.get("shop_id")).collect())
    }

    async fn oldest_unadmitted_event(&self, shop_id: Uuid) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE shop_id = $1 AND queued_at IS NULL
            ORDER BY created_at, id
            LIMIT 1
            "#
        ))
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get oldest unadmitted event"))?;

        Ok(row.as_ref().map(event_from_row))
    }

    async fn unadmitted_event_count(&self, shop_id: Option<Uuid>) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM events
            WHERE queued_at IS NULL
              AND ($1::uuid IS NULL OR shop_id = $1)
            "#,
        )
        .bind(shop_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to count unadmitted events"))?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn mark_event_admitted(
        &self,
        event_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET queued_at = $2
            WHERE id = $1 AND queued_at IS NULL
            "#,
        )
        .bind(event_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to mark event admitted"))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn get_or_create_attempt(
        &self,
        event_id: Uuid,
        registration_id: Uuid,
    ) -> Result<DeliveryAttempt, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_attempts (id, event_id, webhook_registration_id, status, attempts)
            VALUES ($1, $2, $3, 'pending', 0)
            ON CONFLICT (event_id, webhook_registration_id) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(event_id)
        .bind(registration_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to create delivery attempt"))?;

        self.find_attempt(event_id, registration_id)
            .await?
            .ok_or_else(|| {
                StoreError::Database(format!(
                    "attempt for event {event_id} / registration {registration_id} missing after upsert"
                ))
            })
    }

    async fn find_attempt(
        &self,
        event_id: Uuid,
        registration_id: Uuid,
    ) -> Result<Option<DeliveryAttempt>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS}
            FROM delivery_attempts
            WHERE event_id = $1 AND webhook_registration_id = $2
            "#
        ))
        .bind(event_id)
        .bind(registration_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find delivery attempt"))?;

        row.as_ref().map(attempt_from_row).transpose()
    }

    #[instrument(skip(self, outcome), fields(succeeded = outcome.succeeded))]
    async fn record_attempt_outcome(
        &self,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        max_attempts: u32,
    ) -> Result<Option<DeliveryAttempt>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE delivery_attempts
            SET attempts = attempts + 1,
                status = CASE
                    WHEN $2 THEN 'success'
                    WHEN attempts + 1 >= $3 THEN 'dead'
                    ELSE 'failed'
                END,
                response_code = $4,
                response_body = $5,
                last_attempt_at = $6
            WHERE id = $1 AND status NOT IN ('success', 'dead')
            RETURNING {ATTEMPT_COLUMNS}
            "#
        ))
        .bind(attempt_id)
        .bind(outcome.succeeded)
        .bind(max_attempts as i32)
        .bind(outcome.response_code.map(i32::from))
        .bind(&outcome.response_body)
        .bind(outcome.attempted_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to record attempt outcome"))?;

        if let Some(row) = row {
            return attempt_from_row(&row).map(Some);
        }

        // Nothing updated: either terminal or missing
        let exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM delivery_attempts WHERE id = $1")
                .bind(attempt_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("Failed to look up delivery attempt"))?;

        match exists {
            Some(_) => Ok(None),
            None => Err(StoreError::AttemptNotFound(attempt_id)),
        }
    }

    async fn list_attempts(&self, event_id: Uuid) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ATTEMPT_COLUMNS}
            FROM delivery_attempts
            WHERE event_id = $1
            ORDER BY created_at, id
            "#
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list delivery attempts"))?;

        rows.iter().map(attempt_from_row).collect()
    }
}
