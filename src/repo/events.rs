//! Transactional event storage and filter-driven historical retrieval.

use relay_protocol::{kind_category, Event, Filter, KindCategory};
use sqlx::{PgPool, QueryBuilder};

use super::EventRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Duplicate,
    /// A replaceable/parameterized-replaceable event that lost the
    /// supersession tie-break against the currently stored one.
    Superseded,
}

/// Insert `event`, applying replaceable/parameterized-replaceable
/// supersession and kind-5 deletion semantics within a single transaction.
///
/// Ephemeral events must not be passed here; the session routes them
/// directly to the subscription manager without persistence.
pub async fn store(pool: &PgPool, event: &Event) -> Result<StoreOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let existing = sqlx::query_scalar!("SELECT id FROM events WHERE id = $1", event.id)
        .fetch_optional(&mut *tx)
        .await?;
    if existing.is_some() {
        tx.commit().await?;
        return Ok(StoreOutcome::Duplicate);
    }

    match kind_category(event.kind) {
        KindCategory::Replaceable => {
            if !supersede_replaceable(&mut tx, &event.pubkey, event.kind, event.created_at, &event.id).await? {
                tx.rollback().await?;
                return Ok(StoreOutcome::Superseded);
            }
        }
        KindCategory::ParameterizedReplaceable => {
            let d = relay_protocol::d_tag_value(event);
            if !supersede_parameterized(&mut tx, &event.pubkey, event.kind, &d, event.created_at, &event.id).await? {
                tx.rollback().await?;
                return Ok(StoreOutcome::Superseded);
            }
        }
        KindCategory::Ephemeral => {
            tx.rollback().await?;
            return Ok(StoreOutcome::Stored);
        }
        KindCategory::Regular | KindCategory::Deletion => {}
    }

    let tags_json = serde_json::to_value(&event.tags).unwrap_or(serde_json::Value::Array(vec![]));

    sqlx::query!(
        r#"INSERT INTO events (id, author_key, created_at, kind, tags_json, content, sig)
           VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        event.id,
        event.pubkey,
        event.created_at,
        event.kind,
        tags_json,
        event.content,
        event.sig,
    )
    .execute(&mut *tx)
    .await?;

    for (position, tag) in event.tags.iter().enumerate() {
        let name = tag.first().cloned().unwrap_or_default();
        let value = tag.get(1).cloned();
        sqlx::query!(
            r#"INSERT INTO tags (event_id, name, value, position) VALUES ($1, $2, $3, $4)"#,
            event.id,
            name,
            value,
            position as i32,
        )
        .execute(&mut *tx)
        .await?;
    }

    if kind_category(event.kind) == KindCategory::Deletion {
        apply_deletions(&mut tx, event).await?;
    }

    tx.commit().await?;
    Ok(StoreOutcome::Stored)
}

/// Tombstone the currently stored replaceable event for `(author_key,
/// kind)` if the incoming one supersedes it. Returns `false` if an existing
/// event outranks the incoming one, meaning it must not be inserted.
async fn supersede_replaceable(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    author_key: &str,
    kind: i64,
    created_at: i64,
    incoming_id: &str,
) -> Result<bool, sqlx::Error> {
    let current = sqlx::query!(
        r#"SELECT id, created_at FROM events
           WHERE author_key = $1 AND kind = $2 AND tombstoned = false"#,
        author_key,
        kind,
    )
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = current else { return Ok(true) };
    if !wins(created_at, incoming_id, row.created_at, &row.id) {
        return Ok(false);
    }
    sqlx::query!("UPDATE events SET tombstoned = true WHERE id = $1", row.id)
        .execute(&mut **tx)
        .await?;
    Ok(true)
}

/// Same as [`supersede_replaceable`] but keyed on `(author_key, kind,
/// d-tag)`.
async fn supersede_parameterized(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    author_key: &str,
    kind: i64,
    d: &str,
    created_at: i64,
    incoming_id: &str,
) -> Result<bool, sqlx::Error> {
    let current = sqlx::query!(
        r#"SELECT e.id, e.created_at FROM events e
           JOIN tags t ON t.event_id = e.id AND t.name = 'd' AND t.value = $3
           WHERE e.author_key = $1 AND e.kind = $2 AND e.tombstoned = false"#,
        author_key,
        kind,
        d,
    )
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = current else { return Ok(true) };
    if !wins(created_at, incoming_id, row.created_at, &row.id) {
        return Ok(false);
    }
    sqlx::query!("UPDATE events SET tombstoned = true WHERE id = $1", row.id)
        .execute(&mut **tx)
        .await?;
    Ok(true)
}

/// True iff the incoming event supersedes the current one: greater
/// `created_at`, or equal `created_at` and greater lexicographic `id`.
fn wins(incoming_created_at: i64, incoming_id: &str, current_created_at: i64, current_id: &str) -> bool {
    (incoming_created_at, incoming_id) > (current_created_at, current_id)
}

async fn apply_deletions(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, deletion_event: &Event) -> Result<(), sqlx::Error> {
    for tag in deletion_event.tags_named("e") {
        let Some(target_id) = tag.get(1) else { continue };
        let target = sqlx::query!("SELECT author_key FROM events WHERE id = $1", target_id)
            .fetch_optional(&mut **tx)
            .await?;
        let Some(target) = target else { continue };
        if target.author_key != deletion_event.pubkey {
            continue;
        }
        sqlx::query!("UPDATE events SET tombstoned = true WHERE id = $1", target_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query!(
            r#"INSERT INTO deletions (target_event_id, deletion_event_id, at) VALUES ($1, $2, now())"#,
            target_id,
            deletion_event.id,
        )
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Return non-tombstoned events matching `filter`, newest first, truncated
/// to `min(filter.limit, max_limit)`. All user-supplied values are bound as
/// query parameters; no value is ever interpolated into the SQL text.
pub async fn query(pool: &PgPool, filter: &Filter, max_limit: u32) -> Result<Vec<Event>, sqlx::Error> {
    let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
        "SELECT id, author_key, created_at, kind, tags_json, content, sig FROM events WHERE tombstoned = false",
    );

    if let Some(ids) = &filter.ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        builder.push(" AND id = ANY(");
        builder.push_bind(ids.clone());
        builder.push(")");
    }
    if let Some(authors) = &filter.authors {
        if authors.is_empty() {
            return Ok(Vec::new());
        }
        builder.push(" AND author_key = ANY(");
        builder.push_bind(authors.clone());
        builder.push(")");
    }
    if let Some(kinds) = &filter.kinds {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        builder.push(" AND kind = ANY(");
        builder.push_bind(kinds.clone());
        builder.push(")");
    }
    if let Some(e_ids) = &filter.e {
        if e_ids.is_empty() {
            return Ok(Vec::new());
        }
        builder.push(" AND EXISTS (SELECT 1 FROM tags t WHERE t.event_id = events.id AND t.name = 'e' AND t.value = ANY(");
        builder.push_bind(e_ids.clone());
        builder.push("))");
    }
    if let Some(p_ids) = &filter.p {
        if p_ids.is_empty() {
            return Ok(Vec::new());
        }
        builder.push(" AND EXISTS (SELECT 1 FROM tags t WHERE t.event_id = events.id AND t.name = 'p' AND t.value = ANY(");
        builder.push_bind(p_ids.clone());
        builder.push("))");
    }
    if let Some(since) = filter.since {
        builder.push(" AND created_at >= ");
        builder.push_bind(since);
    }
    if let Some(until) = filter.until {
        builder.push(" AND created_at <= ");
        builder.push_bind(until);
    }

    builder.push(" ORDER BY created_at DESC, id DESC LIMIT ");
    let limit = filter.limit.unwrap_or(max_limit).min(max_limit);
    builder.push_bind(i64::from(limit));

    let rows: Vec<EventRow> = builder.build_query_as().fetch_all(pool).await?;
    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        if let Ok(event) = row.into_event() {
            events.push(event);
        }
    }
    Ok(events)
}

/// Administrative wipe; not exposed on the wire.
pub async fn delete_all(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query!("DELETE FROM deletions").execute(pool).await?;
    sqlx::query!("DELETE FROM tags").execute(pool).await?;
    sqlx::query!("DELETE FROM events").execute(pool).await?;
    Ok(())
}
