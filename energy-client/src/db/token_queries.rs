use anyhow::Result;
use sqlx::PgPool;
use time::Date;

use crate::domain::UserToken;

pub async fn insert_token(pool: &PgPool, token: &str, init_time: Date) -> Result<()> {
    sqlx::query("INSERT INTO user_token (token, init_time) VALUES ($1, $2)")
        .bind(token)
        .bind(init_time)
        .execute(pool)
        .await?;
    Ok(())
}

/// Tokens registered on or after `cutoff`.
pub async fn tokens_since(pool: &PgPool, cutoff: Date) -> Result<Vec<UserToken>> {
    let rows = sqlx::query_as::<_, UserToken>(
        "SELECT token, init_time FROM user_token WHERE init_time >= $1 ORDER BY init_time",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
