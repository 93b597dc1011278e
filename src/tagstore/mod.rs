// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Tag store: index of analyzed images by tag, category, user and content hash

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::{OrganizerError, Result};

/// Tag store handle (thread-safe, cheap to clone)
#[derive(Clone)]
pub struct TagStore {
    conn: Arc<Mutex<Connection>>,
}

/// An analyzed image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    #[serde(default = "new_image_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
    /// ID of the file the record was made from
    #[serde(default)]
    pub source_id: Option<String>,
    /// Folder path and name the image was organized to
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: i64,
}

/// Tag store statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagStoreStats {
    pub image_count: i64,
    pub tag_count: i64,
    pub category_count: i64,
    pub user_count: i64,
}

const IMAGE_COLUMNS: &str =
    "id, name, user_id, category, content_hash, source_id, destination, metadata, created_at";

impl TagStore {
    /// Open or create the tag store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    /// Open an in-memory tag store (for testing)
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize()?;
        Ok(store)
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| OrganizerError::TagStore("lock poisoned".to_string()))
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                user_id TEXT,
                category TEXT NOT NULL,
                content_hash TEXT,
                source_id TEXT,
                destination TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS image_tags (
                image_id TEXT NOT NULL REFERENCES images(id) ON DELETE CASCADE,
                tag TEXT NOT NULL,
                PRIMARY KEY (image_id, tag)
            );

            CREATE INDEX IF NOT EXISTS idx_image_tags_tag ON image_tags(tag);
            CREATE INDEX IF NOT EXISTS idx_images_category ON images(category);
            CREATE INDEX IF NOT EXISTS idx_images_user ON images(user_id);
            CREATE INDEX IF NOT EXISTS idx_images_hash ON images(content_hash);
        "#,
        )?;
        Ok(())
    }

    /// Insert or replace an image record and its tag set
    pub fn store_image_metadata(&self, record: &ImageRecord) -> Result<()> {
        if record.id.trim().is_empty() {
            return Err(OrganizerError::Validation("image id must not be empty".to_string()));
        }

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let metadata = serde_json::to_string(&record.metadata)?;

        tx.execute(
            r#"INSERT INTO images (id, name, user_id, category, content_hash, source_id, destination, metadata, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   user_id = excluded.user_id,
                   category = excluded.category,
                   content_hash = excluded.content_hash,
                   source_id = excluded.source_id,
                   destination = excluded.destination,
                   metadata = excluded.metadata"#,
            params![
                record.id,
                record.name,
                record.user_id,
                record.category,
                record.content_hash,
                record.source_id,
                record.destination,
                metadata,
                record.created_at.to_rfc3339(),
            ],
        )?;

        tx.execute("DELETE FROM image_tags WHERE image_id = ?1", params![record.id])?;
        for tag in normalize_tags(&record.tags) {
            tx.execute(
                "INSERT OR IGNORE INTO image_tags (image_id, tag) VALUES (?1, ?2)",
                params![record.id, tag],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_image_metadata(&self, id: &str) -> Result<Option<ImageRecord>> {
        let conn = self.lock_conn()?;
        let sql = format!("SELECT {} FROM images WHERE id = ?1", IMAGE_COLUMNS);
        let record = conn.query_row(&sql, params![id], image_from_row).optional()?;

        match record {
            Some(mut record) => {
                record.tags = tags_for(&conn, &record.id)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// IDs of images carrying a tag
    pub fn images_with_tag(&self, tag: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT image_id FROM image_tags WHERE tag = ?1 ORDER BY image_id")?;
        let ids = stmt
            .query_map(params![tag.trim().to_lowercase()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// IDs of images carrying every one of `tags`
    pub fn images_with_all_tags(&self, tags: &[String]) -> Result<Vec<String>> {
        let tags = normalize_tags(tags);
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; tags.len()].join(", ");
        let sql = format!(
            "SELECT image_id FROM image_tags WHERE tag IN ({}) \
             GROUP BY image_id HAVING COUNT(DISTINCT tag) = {} ORDER BY image_id",
            placeholders,
            tags.len()
        );

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(tags.iter()), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    pub fn images_in_category(&self, category: &str) -> Result<Vec<String>> {
        self.ids_where("category = ?1", category)
    }

    pub fn images_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.ids_where("user_id = ?1", user_id)
    }

    fn ids_where(&self, condition: &str, value: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let sql = format!("SELECT id FROM images WHERE {} ORDER BY created_at DESC, id", condition);
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params![value], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Load full records for a list of IDs, skipping unknown ones
    pub fn get_many(&self, ids: &[String]) -> Result<Vec<ImageRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_image_metadata(id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Check for a duplicate by content hash
    pub fn find_by_hash(&self, content_hash: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM images WHERE content_hash = ?1 LIMIT 1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn all_tags(&self) -> Result<Vec<TagCount>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT tag, COUNT(*) AS cnt FROM image_tags GROUP BY tag ORDER BY cnt DESC, tag",
        )?;
        let tags = stmt
            .query_map([], |row| {
                Ok(TagCount {
                    tag: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tags)
    }

    pub fn categories(&self) -> Result<Vec<CategoryCount>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*) AS cnt FROM images GROUP BY category ORDER BY cnt DESC, category",
        )?;
        let cats = stmt
            .query_map([], |row| {
                Ok(CategoryCount {
                    category: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cats)
    }

    pub fn stats(&self) -> Result<TagStoreStats> {
        let conn = self.lock_conn()?;
        let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |row| row.get(0)) };
        Ok(TagStoreStats {
            image_count: count("SELECT COUNT(*) FROM images")?,
            tag_count: count("SELECT COUNT(DISTINCT tag) FROM image_tags")?,
            category_count: count("SELECT COUNT(DISTINCT category) FROM images")?,
            user_count: count("SELECT COUNT(DISTINCT user_id) FROM images WHERE user_id IS NOT NULL")?,
        })
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<ImageRecord>> {
        self.query_records(
            &format!("SELECT {} FROM images ORDER BY created_at DESC, id LIMIT ?1", IMAGE_COLUMNS),
            params![limit as i64],
        )
    }

    /// Match images by name, category or tag
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<ImageRecord>> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        self.query_records(
            &format!(
                r#"SELECT {} FROM images
                   WHERE name LIKE ?1 ESCAPE '\' OR category LIKE ?1 ESCAPE '\'
                      OR id IN (SELECT image_id FROM image_tags WHERE tag LIKE ?1 ESCAPE '\')
                   ORDER BY created_at DESC, id LIMIT ?2"#,
                IMAGE_COLUMNS
            ),
            params![pattern, limit as i64],
        )
    }

    fn query_records(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<ImageRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let mut records = stmt
            .query_map(args, image_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for record in &mut records {
            record.tags = tags_for(&conn, &record.id)?;
        }
        Ok(records)
    }

    /// Remove a tag from an image; `false` if the image did not carry it
    pub fn remove_tag(&self, image_id: &str, tag: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM image_tags WHERE image_id = ?1 AND tag = ?2",
            params![image_id, tag.trim().to_lowercase()],
        )?;
        Ok(removed > 0)
    }

    pub fn delete_image(&self, image_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let removed = conn.execute("DELETE FROM images WHERE id = ?1", params![image_id])?;
        Ok(removed > 0)
    }

    pub fn vacuum(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("VACUUM", [])?;
        Ok(())
    }
}

/// Generate a new image record ID
pub fn new_image_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lowercased, trimmed, deduplicated tags with empties dropped
fn normalize_tags(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

fn tags_for(conn: &Connection, image_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT tag FROM image_tags WHERE image_id = ?1 ORDER BY tag")?;
    let tags = stmt
        .query_map(params![image_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(tags)
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    let metadata: String = row.get(7)?;
    let created: String = row.get(8)?;
    Ok(ImageRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        user_id: row.get(2)?,
        category: row.get(3)?,
        tags: Vec::new(),
        content_hash: row.get(4)?,
        source_id: row.get(5)?,
        destination: row.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        created_at: DateTime::parse_from_rfc3339(&created)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Escape `LIKE` wildcards so they match literally
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, category: &str, tags: &[&str]) -> ImageRecord {
        ImageRecord {
            id: id.to_string(),
            name: format!("{}.jpg", id),
            user_id: Some("user-1".to_string()),
            category: category.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            content_hash: Some(format!("hash-{}", id)),
            source_id: None,
            destination: None,
            metadata: serde_json::json!({"width": 10}),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_store_and_get() {
        let store = TagStore::in_memory().unwrap();
        store.store_image_metadata(&record("a", "Animals", &["Dog", " grass ", "", "dog"])).unwrap();

        let got = store.get_image_metadata("a").unwrap().unwrap();
        assert_eq!(got.tags, vec!["dog".to_string(), "grass".to_string()]);
        assert_eq!(got.metadata["width"], 10);
        assert_eq!(got.created_at, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        assert!(store.get_image_metadata("missing").unwrap().is_none());
    }

    #[test]
    fn test_restore_replaces_tags() {
        let store = TagStore::in_memory().unwrap();
        store.store_image_metadata(&record("a", "Animals", &["dog"])).unwrap();
        store.store_image_metadata(&record("a", "Landscapes", &["beach"])).unwrap();

        assert!(store.images_with_tag("dog").unwrap().is_empty());
        assert_eq!(store.images_with_tag("BEACH").unwrap(), vec!["a".to_string()]);
        assert_eq!(store.images_in_category("Landscapes").unwrap(), vec!["a".to_string()]);
        assert!(store.images_in_category("Animals").unwrap().is_empty());
    }

    #[test]
    fn test_intersection_retrieval() {
        let store = TagStore::in_memory().unwrap();
        store.store_image_metadata(&record("a", "Animals", &["dog", "beach"])).unwrap();
        store.store_image_metadata(&record("b", "Animals", &["dog"])).unwrap();
        store.store_image_metadata(&record("c", "Landscapes", &["beach"])).unwrap();

        let both = store
            .images_with_all_tags(&["dog".to_string(), "Beach".to_string()])
            .unwrap();
        assert_eq!(both, vec!["a".to_string()]);
        assert!(store.images_with_all_tags(&[]).unwrap().is_empty());
        assert_eq!(store.images_for_user("user-1").unwrap().len(), 3);
    }

    #[test]
    fn test_counts_and_stats() {
        let store = TagStore::in_memory().unwrap();
        store.store_image_metadata(&record("a", "Animals", &["dog", "grass"])).unwrap();
        store.store_image_metadata(&record("b", "Animals", &["dog"])).unwrap();
        store.store_image_metadata(&record("c", "Food", &["meal"])).unwrap();

        let tags = store.all_tags().unwrap();
        assert_eq!(tags[0], TagCount { tag: "dog".to_string(), count: 2 });

        let cats = store.categories().unwrap();
        assert_eq!(cats[0], CategoryCount { category: "Animals".to_string(), count: 2 });

        let stats = store.stats().unwrap();
        assert_eq!(stats.image_count, 3);
        assert_eq!(stats.tag_count, 3);
        assert_eq!(stats.category_count, 2);
        assert_eq!(stats.user_count, 1);
    }

    #[test]
    fn test_find_by_hash() {
        let store = TagStore::in_memory().unwrap();
        store.store_image_metadata(&record("a", "Other", &[])).unwrap();
        assert_eq!(store.find_by_hash("hash-a").unwrap(), Some("a".to_string()));
        assert_eq!(store.find_by_hash("hash-z").unwrap(), None);
    }

    #[test]
    fn test_search_matches_tags_and_names() {
        let store = TagStore::in_memory().unwrap();
        store.store_image_metadata(&record("sunny", "Landscapes", &["beach"])).unwrap();
        store.store_image_metadata(&record("pup", "Animals", &["dog"])).unwrap();

        let hits = store.search("bea", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "sunny");
        assert_eq!(hits[0].tags, vec!["beach".to_string()]);
        assert_eq!(store.search("pup", 10).unwrap()[0].id, "pup");
        assert_eq!(store.recent(1).unwrap().len(), 1);
    }

    #[test]
    fn test_search_treats_wildcards_literally() {
        let store = TagStore::in_memory().unwrap();
        store.store_image_metadata(&record("img_1", "Other", &["100%"])).unwrap();
        store.store_image_metadata(&record("imgx1", "Other", &["1000"])).unwrap();

        let hits = store.search("g_1", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "img_1");
        assert_eq!(store.search("0%", 10).unwrap()[0].id, "img_1");
        assert!(store.search("_", 10).unwrap().iter().all(|r| r.id == "img_1"));
    }

    #[test]
    fn test_poisoned_lock_is_a_store_error() {
        let store = TagStore::in_memory().unwrap();
        let handle = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = handle.conn.lock().unwrap();
            panic!("poison the connection lock");
        })
        .join();

        assert!(matches!(store.stats(), Err(OrganizerError::TagStore(_))));
    }

    #[test]
    fn test_remove_tag_and_delete() {
        let store = TagStore::in_memory().unwrap();
        store.store_image_metadata(&record("a", "Animals", &["dog", "grass"])).unwrap();

        assert!(store.remove_tag("a", "Grass").unwrap());
        assert!(!store.remove_tag("a", "grass").unwrap());
        assert_eq!(store.get_image_metadata("a").unwrap().unwrap().tags, vec!["dog".to_string()]);

        assert!(store.delete_image("a").unwrap());
        assert!(store.images_with_tag("dog").unwrap().is_empty());
        assert!(!store.delete_image("a").unwrap());
        store.vacuum().unwrap();
    }

    #[test]
    fn test_empty_id_rejected() {
        let store = TagStore::in_memory().unwrap();
        assert!(matches!(
            store.store_image_metadata(&record("", "Other", &[])),
            Err(OrganizerError::Validation(_))
        ));
    }

    #[test]
    fn test_reopen_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/tags.db");
        TagStore::open(&path).unwrap().store_image_metadata(&record("a", "Food", &["meal"])).unwrap();
        let reopened = TagStore::open(&path).unwrap();
        assert_eq!(reopened.images_in_category("Food").unwrap(), vec!["a".to_string()]);
    }
}
