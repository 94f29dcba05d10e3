pub mod events;

use relay_protocol::Event;

/// Raw row shape returned by the repository's query methods; `tags_json`
/// carries the full, order-preserving tag list as stored, separate from the
/// normalized `tags` table used for selector lookups.
#[derive(Debug, sqlx::FromRow)]
pub struct EventRow {
    pub id: String,
    pub author_key: String,
    pub created_at: i64,
    pub kind: i64,
    pub tags_json: serde_json::Value,
    pub content: String,
    pub sig: String,
}

impl EventRow {
    pub fn into_event(self) -> Result<Event, serde_json::Error> {
        let tags: Vec<Vec<String>> = serde_json::from_value(self.tags_json)?;
        Ok(Event {
            id: self.id,
            pubkey: self.author_key,
            created_at: self.created_at,
            kind: self.kind,
            tags,
            content: self.content,
            sig: self.sig,
        })
    }
}
