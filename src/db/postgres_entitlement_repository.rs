use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::{
    billing_event_log::BillingEventLog,
    entitlement_repository::{EntitlementRepository, EntitlementTransaction},
    entitlement_store::EntitlementStore,
    usage_ledger::UsageLedger,
};
use crate::models::{
    entitlement::{EntitlementSnapshot, SnapshotUpdate},
    usage::UsageCounters,
};

const SNAPSHOT_COLUMNS: &str = "user_id, is_active, plan_id, current_period_end, \
     external_customer_id, external_subscription_id";

pub struct PostgresEntitlementRepository {
    pub pool: PgPool,
}

pub struct PostgresEntitlementTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl EntitlementRepository for PostgresEntitlementRepository {
    async fn begin(&self) -> Result<Box<dyn EntitlementTransaction>, sqlx::Error> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresEntitlementTransaction { tx }))
    }

    async fn begin_read_only(&self) -> Result<Box<dyn EntitlementTransaction>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query::<Postgres>("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PostgresEntitlementTransaction { tx }))
    }

    async fn prune_processed_events(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query::<Postgres>("DELETE FROM billing_event_log WHERE processed_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EntitlementTransaction for PostgresEntitlementTransaction {
    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}

#[async_trait]
impl UsageLedger for PostgresEntitlementTransaction {
    async fn get_counters(&mut self, user_id: Uuid) -> Result<UsageCounters, sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        let row = sqlx::query_as::<Postgres, UsageCounters>(
            r#"
            SELECT note_count, meeting_seconds_used, last_meeting_start
            FROM user_usage
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(conn)
        .await?;

        Ok(row.unwrap_or_default())
    }

    async fn lock_counters(&mut self, user_id: Uuid) -> Result<UsageCounters, sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        sqlx::query::<Postgres>(
            "INSERT INTO user_usage (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

        sqlx::query_as::<Postgres, UsageCounters>(
            r#"
            SELECT note_count, meeting_seconds_used, last_meeting_start
            FROM user_usage
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_one(conn)
        .await
    }

    async fn increment_note_count(&mut self, user_id: Uuid) -> Result<i64, sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        sqlx::query_scalar::<Postgres, i64>(
            r#"
            INSERT INTO user_usage (user_id, note_count)
            VALUES ($1, 1)
            ON CONFLICT (user_id) DO UPDATE
                SET note_count = user_usage.note_count + 1,
                    updated_at = now()
            RETURNING note_count
            "#,
        )
        .bind(user_id)
        .fetch_one(conn)
        .await
    }

    async fn set_meeting_start(
        &mut self,
        user_id: Uuid,
        started_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        sqlx::query::<Postgres>(
            r#"
            INSERT INTO user_usage (user_id, last_meeting_start)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
                SET last_meeting_start = EXCLUDED.last_meeting_start,
                    updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(started_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    async fn clear_meeting_start(&mut self, user_id: Uuid) -> Result<(), sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        sqlx::query::<Postgres>(
            "UPDATE user_usage SET last_meeting_start = NULL, updated_at = now() WHERE user_id = $1",
        )
        .bind(user_id)
        .execute(conn)
        .await?;

        Ok(())
    }

    async fn add_meeting_seconds(&mut self, user_id: Uuid, delta: i64) -> Result<i64, sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        sqlx::query_scalar::<Postgres, i64>(
            r#"
            INSERT INTO user_usage (user_id, meeting_seconds_used)
            VALUES ($1, GREATEST($2, 0))
            ON CONFLICT (user_id) DO UPDATE
                SET meeting_seconds_used = user_usage.meeting_seconds_used + GREATEST($2, 0),
                    updated_at = now()
            RETURNING meeting_seconds_used
            "#,
        )
        .bind(user_id)
        .bind(delta)
        .fetch_one(conn)
        .await
    }
}

#[async_trait]
impl EntitlementStore for PostgresEntitlementTransaction {
    async fn user_exists(&mut self, user_id: Uuid) -> Result<bool, sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        sqlx::query_scalar::<Postgres, bool>("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
            .bind(user_id)
            .fetch_one(conn)
            .await
    }

    async fn get_snapshot(
        &mut self,
        user_id: Uuid,
    ) -> Result<Option<EntitlementSnapshot>, sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM user_entitlements WHERE user_id = $1");
        sqlx::query_as::<Postgres, EntitlementSnapshot>(&sql)
            .bind(user_id)
            .fetch_optional(conn)
            .await
    }

    async fn upsert_snapshot(
        &mut self,
        user_id: Uuid,
        update: &SnapshotUpdate,
    ) -> Result<EntitlementSnapshot, sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        let sql = format!(
            r#"
            INSERT INTO user_entitlements (
                user_id,
                is_active,
                plan_id,
                current_period_end,
                external_customer_id,
                external_subscription_id
            )
            VALUES ($1, COALESCE($2, FALSE), $3, $4, $5, $6)
            ON CONFLICT (user_id) DO UPDATE
                SET is_active = COALESCE($2, user_entitlements.is_active),
                    plan_id = COALESCE($3, user_entitlements.plan_id),
                    current_period_end = COALESCE($4, user_entitlements.current_period_end),
                    external_customer_id = COALESCE($5, user_entitlements.external_customer_id),
                    external_subscription_id =
                        COALESCE($6, user_entitlements.external_subscription_id),
                    updated_at = now()
            RETURNING {SNAPSHOT_COLUMNS}
            "#
        );
        sqlx::query_as::<Postgres, EntitlementSnapshot>(&sql)
            .bind(user_id)
            .bind(update.is_active)
            .bind(update.plan_id.as_deref())
            .bind(update.current_period_end)
            .bind(update.external_customer_id.as_deref())
            .bind(update.external_subscription_id.as_deref())
            .fetch_one(conn)
            .await
    }

    async fn clear_subscription(
        &mut self,
        user_id: Uuid,
    ) -> Result<Option<EntitlementSnapshot>, sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        let sql = format!(
            r#"
            UPDATE user_entitlements
            SET is_active = FALSE,
                plan_id = NULL,
                current_period_end = NULL,
                external_subscription_id = NULL,
                updated_at = now()
            WHERE user_id = $1
            RETURNING {SNAPSHOT_COLUMNS}
            "#
        );
        sqlx::query_as::<Postgres, EntitlementSnapshot>(&sql)
            .bind(user_id)
            .fetch_optional(conn)
            .await
    }

    async fn find_user_by_external_customer_id(
        &mut self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        sqlx::query_scalar::<Postgres, Uuid>(
            "SELECT user_id FROM user_entitlements WHERE external_customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(conn)
        .await
    }

    async fn find_user_by_external_subscription_id(
        &mut self,
        subscription_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        sqlx::query_scalar::<Postgres, Uuid>(
            "SELECT user_id FROM user_entitlements WHERE external_subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(conn)
        .await
    }
}

#[async_trait]
impl BillingEventLog for PostgresEntitlementTransaction {
    async fn record_event(
        &mut self,
        event_id: &str,
        event_type: &str,
        processed_at: OffsetDateTime,
    ) -> Result<bool, sqlx::Error> {
        let conn: &mut PgConnection = &mut *self.tx;
        // Blocks behind a concurrent uncommitted insert of the same id, then sees the conflict.
        let inserted = sqlx::query_scalar::<Postgres, String>(
            r#"
            INSERT INTO billing_event_log (event_id, event_type, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(processed_at)
        .fetch_optional(conn)
        .await?
        .is_some();

        Ok(inserted)
    }
}
