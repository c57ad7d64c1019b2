//! Registered notification kinds and the unsubscribe lookups that gate
//! delivery.
//!
//! A client registers the kinds it sends, each optionally `critical`.
//! Critical kinds always reach the user; any other kind is withheld from a
//! user who unsubscribed from it, or from everything.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindRegistration {
    pub id: String,
    pub description: String,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub client_id: String,
    pub source_description: String,
    pub kinds: Vec<KindRegistration>,
}

impl Registration {
    pub fn has_critical_kinds(&self) -> bool {
        self.kinds.iter().any(|k| k.critical)
    }
}

#[async_trait]
pub trait Preferences: Send + Sync {
    /// Create or update the client and every listed kind.
    async fn register(&self, registration: &Registration) -> Result<(), StoreError>;

    /// Whether `kind_id` from `client_id` may be sent to `user_guid`.
    /// Unregistered kinds count as non-critical.
    async fn allows(
        &self,
        user_guid: &str,
        client_id: &str,
        kind_id: &str,
    ) -> Result<bool, StoreError>;
}

#[derive(Clone)]
pub struct PgPreferences {
    pool: PgPool,
}

impl PgPreferences {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Preferences for PgPreferences {
    async fn register(&self, registration: &Registration) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO clients (id, description)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET description = EXCLUDED.description
            "#,
        )
        .bind(&registration.client_id)
        .bind(&registration.source_description)
        .execute(&mut *tx)
        .await?;

        for kind in &registration.kinds {
            sqlx::query(
                r#"
                INSERT INTO kinds (client_id, id, description, critical)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (client_id, id) DO UPDATE
                SET description = EXCLUDED.description,
                    critical = EXCLUDED.critical
                "#,
            )
            .bind(&registration.client_id)
            .bind(&kind.id)
            .bind(&kind.description)
            .bind(kind.critical)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            client_id = %registration.client_id,
            kinds = registration.kinds.len(),
            "Client registered"
        );
        Ok(())
    }

    async fn allows(
        &self,
        user_guid: &str,
        client_id: &str,
        kind_id: &str,
    ) -> Result<bool, StoreError> {
        let (critical, global, unsubscribed): (bool, bool, bool) = sqlx::query_as(
            r#"
            SELECT
                COALESCE((SELECT critical FROM kinds WHERE client_id = $2 AND id = $3), FALSE),
                EXISTS (SELECT 1 FROM global_unsubscribes WHERE user_id = $1),
                EXISTS (
                    SELECT 1 FROM unsubscribes
                    WHERE user_id = $1 AND client_id = $2 AND kind_id = $3
                )
            "#,
        )
        .bind(user_guid)
        .bind(client_id)
        .bind(kind_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(critical || !(global || unsubscribed))
    }
}
