//! Users, cookie sessions, and preferences.

use sqlx::any::AnyRow;

use crate::error::{Error, Result};
use crate::model::{User, UserSession};
use crate::store::{Store, get_i64, get_string};
use crate::{id, now_ms};

fn user_from_row(row: &AnyRow) -> Result<User> {
    Ok(User {
        id: get_string(row, "id")?,
        provider: get_string(row, "provider")?,
        provider_id: get_string(row, "provider_id")?,
        name: get_string(row, "name")?,
        created_at: get_i64(row, "created_at")?,
    })
}

impl Store {
    pub async fn create_user(&self, provider: &str, provider_id: &str, name: &str) -> Result<User> {
        let user = User {
            id: id::new_id(),
            provider: provider.to_string(),
            provider_id: provider_id.to_string(),
            name: name.to_string(),
            created_at: now_ms(),
        };
        sqlx::query(
            "INSERT INTO users (id, provider, provider_id, name, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&user.id)
        .bind(&user.provider)
        .bind(&user.provider_id)
        .bind(&user.name)
        .bind(user.created_at)
        .execute(self.pool())
        .await?;
        Ok(user)
    }

    pub async fn get_user(&self, id: &str) -> Result<User> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| Error::NotFound(format!("user '{id}'")))?;
        user_from_row(&row)
    }

    pub async fn get_user_by_provider(
        &self,
        provider: &str,
        provider_id: &str,
    ) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE provider = $1 AND provider_id = $2")
            .bind(provider)
            .bind(provider_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    /// Fetch an existing `(provider, provider_id)` user or create one.
    pub async fn ensure_user(&self, provider: &str, provider_id: &str, name: &str) -> Result<User> {
        if let Some(user) = self.get_user_by_provider(provider, provider_id).await? {
            return Ok(user);
        }
        self.create_user(provider, provider_id, name).await
    }

    // -- cookie sessions ----------------------------------------------------

    pub async fn create_user_session(
        &self,
        user_id: &str,
        token_hash: &str,
        expires_at: i64,
    ) -> Result<UserSession> {
        let session = UserSession {
            id: id::new_id(),
            user_id: user_id.to_string(),
            token_hash: token_hash.to_string(),
            expires_at,
            created_at: now_ms(),
        };
        sqlx::query(
            "INSERT INTO user_sessions (id, user_id, token_hash, expires_at, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.token_hash)
        .bind(session.expires_at)
        .bind(session.created_at)
        .execute(self.pool())
        .await?;
        Ok(session)
    }

    /// Resolve an unexpired session by its token hash.
    pub async fn get_user_session_by_hash(&self, token_hash: &str) -> Result<Option<UserSession>> {
        let row = sqlx::query(
            "SELECT * FROM user_sessions WHERE token_hash = $1 AND expires_at > $2",
        )
        .bind(token_hash)
        .bind(now_ms())
        .fetch_optional(self.pool())
        .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(UserSession {
            id: get_string(&row, "id")?,
            user_id: get_string(&row, "user_id")?,
            token_hash: get_string(&row, "token_hash")?,
            expires_at: get_i64(&row, "expires_at")?,
            created_at: get_i64(&row, "created_at")?,
        }))
    }

    pub async fn delete_expired_user_sessions(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at <= $1")
            .bind(now_ms())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    // -- preferences --------------------------------------------------------

    /// Upsert: one value per `(user, key)`.
    pub async fn set_user_preference(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let updated = sqlx::query(
            "UPDATE user_prefs SET pref_value = $1 WHERE user_id = $2 AND pref_key = $3",
        )
        .bind(value)
        .bind(user_id)
        .bind(key)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO user_prefs (user_id, pref_key, pref_value) VALUES ($1, $2, $3)",
            )
            .bind(user_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_user_preference(&self, user_id: &str, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT pref_value FROM user_prefs WHERE user_id = $1 AND pref_key = $2",
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(|r| get_string(r, "pref_value")).transpose()
    }

    pub async fn list_user_preferences(&self, user_id: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT pref_key, pref_value FROM user_prefs WHERE user_id = $1 ORDER BY pref_key",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| Ok((get_string(row, "pref_key")?, get_string(row, "pref_value")?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_user_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.ensure_user("github", "42", "Sam").await.unwrap();
        let b = store.ensure_user("github", "42", "Sam").await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn expired_sessions_are_invisible_and_reaped() {
        let store = Store::open_in_memory().await.unwrap();
        let user = store.ensure_user("github", "1", "a").await.unwrap();
        store
            .create_user_session(&user.id, "hash-live", now_ms() + 60_000)
            .await
            .unwrap();
        store
            .create_user_session(&user.id, "hash-dead", now_ms() - 1)
            .await
            .unwrap();

        assert!(store
            .get_user_session_by_hash("hash-live")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_user_session_by_hash("hash-dead")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.delete_expired_user_sessions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn preferences_upsert() {
        let store = Store::open_in_memory().await.unwrap();
        store.set_user_preference("u1", "theme", "dark").await.unwrap();
        store.set_user_preference("u1", "theme", "light").await.unwrap();
        assert_eq!(
            store.get_user_preference("u1", "theme").await.unwrap(),
            Some("light".to_string())
        );
        assert_eq!(store.list_user_preferences("u1").await.unwrap().len(), 1);
    }
}
