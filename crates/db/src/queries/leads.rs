use sqlx::PgPool;

use crate::models::LeadRow;

pub async fn get_by_id(pool: &PgPool, id: &str) -> Result<Option<LeadRow>, sqlx::Error> {
    sqlx::query_as::<_, LeadRow>(
        r#"
        SELECT id, name, email, phone, stage
        FROM leads
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}
