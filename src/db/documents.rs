use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use super::models::{Document, DocumentMetadata, NewChunk};
use super::{StoreError, VectorStore, serialize_vector};

fn map_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        path: row.get(0)?,
        content_hash: row.get(1)?,
        last_modified: row.get::<_, DateTime<Utc>>(2)?,
        size_bytes: row.get::<_, i64>(3)? as u64,
        mime_type: row.get(4)?,
        extractor: row.get(5)?,
        indexed_at: row.get::<_, DateTime<Utc>>(6)?,
    })
}

const DOCUMENT_COLUMNS: &str =
    "path, content_hash, last_modified, size_bytes, mime_type, extractor, indexed_at";

impl VectorStore {
    /// Replace everything stored for `meta.path` with `chunks`.
    ///
    /// Old chunks are deleted and the new set inserted inside one
    /// transaction, so a concurrent reader sees either the previous chunk set
    /// or the new one. Embedding widths are checked before anything is
    /// written.
    pub async fn index_document(
        &self,
        meta: DocumentMetadata,
        chunks: Vec<NewChunk>,
    ) -> Result<(), StoreError> {
        for chunk in &chunks {
            self.check_embedding(&chunk.embedding)?;
        }

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                "DELETE FROM chunks WHERE document_path = ?",
                params![meta.path],
            )?;

            tx.execute(
                r#"
                INSERT INTO documents (path, content_hash, last_modified, size_bytes, mime_type, extractor, indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(path) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    last_modified = excluded.last_modified,
                    size_bytes = excluded.size_bytes,
                    mime_type = excluded.mime_type,
                    extractor = excluded.extractor,
                    indexed_at = excluded.indexed_at
                "#,
                params![
                    meta.path,
                    meta.content_hash,
                    meta.last_modified,
                    meta.size_bytes as i64,
                    meta.mime_type,
                    meta.extractor,
                    Utc::now(),
                ],
            )?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO chunks (document_path, ordinal, text, embedding, char_count) VALUES (?, ?, ?, ?, ?)",
                )?;
                for chunk in &chunks {
                    stmt.execute(params![
                        meta.path,
                        chunk.ordinal as i64,
                        chunk.text,
                        serialize_vector(&chunk.embedding),
                        chunk.text.chars().count() as i64,
                    ])?;
                }
            }

            tx.commit()?;
            debug!(path = %meta.path, chunks = chunks.len(), "document stored");
            Ok(())
        })
        .await
    }

    /// Delete a document and (by cascade) its chunks.
    pub async fn remove_document(&self, path: &str) -> Result<bool, StoreError> {
        let path = path.to_string();
        self.with_conn(move |conn| {
            let rows = conn.execute("DELETE FROM documents WHERE path = ?", params![path])?;
            Ok(rows > 0)
        })
        .await
    }

    /// Delete every document and chunk.
    ///
    /// Takes the database write lock for the duration; callers should not
    /// interleave other index writes with a clear.
    pub async fn clear_index(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM chunks", [])?;
            tx.execute("DELETE FROM documents", [])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_document(&self, path: &str) -> Result<Option<Document>, StoreError> {
        let path = path.to_string();
        self.with_conn(move |conn| {
            let doc = conn
                .query_row(
                    &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE path = ?"),
                    params![path],
                    map_document_row,
                )
                .optional()?;
            Ok(doc)
        })
        .await
    }

    /// All document rows keyed by path.
    pub async fn documents(&self) -> Result<HashMap<String, Document>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents"))?;
            let rows = stmt.query_map([], map_document_row)?;

            let mut docs = HashMap::new();
            for row in rows {
                let doc = row?;
                docs.insert(doc.path.clone(), doc);
            }
            Ok(docs)
        })
        .await
    }

    pub async fn indexed_files(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT path FROM documents ORDER BY path")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut files = Vec::new();
            for row in rows {
                files.push(row?);
            }
            Ok(files)
        })
        .await
    }

    pub async fn chunk_count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}
