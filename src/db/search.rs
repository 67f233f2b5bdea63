use rusqlite::types::Value;

use super::models::{Chunk, RagQuery, SearchResult};
use super::{StoreError, VectorStore, serialize_vector};

fn map_search_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SearchResult> {
    let similarity: f64 = row.get(5)?;
    Ok(SearchResult {
        chunk: Chunk {
            document_path: row.get(0)?,
            id: row.get(1)?,
            ordinal: row.get::<_, i64>(2)? as usize,
            text: row.get(3)?,
            char_count: row.get::<_, i64>(4)? as usize,
        },
        // Float error can push identical vectors a hair past 1.0
        similarity: similarity.min(1.0),
    })
}

impl VectorStore {
    /// Cosine-similarity search over every stored chunk.
    ///
    /// `file_filters` narrow the scanned set to documents whose path contains
    /// any of the given substrings before anything is scored. Results below
    /// `min_similarity` are dropped; the rest come back by descending
    /// similarity, ties broken by document path and then ordinal, capped at
    /// `top_k`.
    pub async fn search(
        &self,
        query: &RagQuery,
        query_vector: &[f32],
    ) -> Result<Vec<SearchResult>, StoreError> {
        query.validate()?;
        self.check_embedding(query_vector)?;

        let mut inner = String::from(
            r#"
            SELECT
                d.path AS path,
                c.id AS chunk_id,
                c.ordinal AS ordinal,
                c.text AS text,
                c.char_count AS char_count,
                1.0 - vec_distance_cosine(c.embedding, ?) AS similarity
            FROM chunks c
            JOIN documents d ON d.path = c.document_path
            "#,
        );

        let mut params: Vec<Value> = vec![Value::Blob(serialize_vector(query_vector))];

        let filters: Vec<&String> = query
            .file_filters
            .iter()
            .filter(|f| !f.is_empty())
            .collect();
        if !filters.is_empty() {
            let clauses = vec!["instr(d.path, ?) > 0"; filters.len()];
            inner.push_str(" WHERE ");
            inner.push_str(&clauses.join(" OR "));
            for f in filters {
                params.push(Value::Text(f.clone()));
            }
        }

        let sql = format!(
            "SELECT path, chunk_id, ordinal, text, char_count, similarity FROM ({inner}) \
             WHERE similarity >= ? \
             ORDER BY similarity DESC, path ASC, ordinal ASC \
             LIMIT ?"
        );
        params.push(Value::Real(query.min_similarity));
        params.push(Value::Integer(query.top_k as i64));

        self.with_conn(move |conn| {
            let param_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(param_refs.as_slice(), map_search_row)?;

            let mut results = Vec::new();
            for row in rows {
                results.push(row?);
            }
            Ok(results)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{DocumentMetadata, NewChunk};
    use crate::db::test_support::temp_store;
    use chrono::Utc;
    use std::sync::Arc;

    fn meta(path: &str) -> DocumentMetadata {
        DocumentMetadata {
            path: path.to_string(),
            content_hash: "h".to_string(),
            last_modified: Utc::now(),
            size_bytes: 1,
            mime_type: "text/plain".to_string(),
            extractor: "plain-text".to_string(),
        }
    }

    fn query(top_k: usize, min_similarity: f64, filters: &[&str]) -> RagQuery {
        RagQuery {
            query_text: "q".to_string(),
            top_k,
            min_similarity,
            file_filters: filters.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn insert(store: &VectorStore, path: &str, vectors: &[[f32; 3]]) {
        let chunks = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| NewChunk {
                ordinal: i,
                text: format!("{path}#{i}"),
                embedding: v.to_vec(),
            })
            .collect();
        store.index_document(meta(path), chunks).await.unwrap();
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let (_dir, store) = temp_store(3);
        insert(&store, "rust.txt", &[[1.0, 0.0, 0.0]]).await;
        insert(&store, "mixed.txt", &[[1.0, 1.0, 0.0], [0.0, 0.0, 1.0]]).await;

        let results = store
            .search(&query(10, 0.0, &[]), &[1.0, 0.0, 0.0])
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].chunk.document_path, "rust.txt");
        assert!(results[0].similarity > 0.99);
        assert_eq!(results[1].chunk.document_path, "mixed.txt");
        assert_eq!(results[1].chunk.ordinal, 0);
        assert!((results[1].similarity - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-3);
        assert!(results[2].similarity.abs() < 1e-6);

        for pair in results.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }

    #[tokio::test]
    async fn test_min_similarity_and_top_k() {
        let (_dir, store) = temp_store(3);
        insert(
            &store,
            "a.txt",
            &[[1.0, 0.0, 0.0], [0.9, 0.1, 0.0], [0.0, 1.0, 0.0]],
        )
        .await;

        let strict = store
            .search(&query(10, 0.9, &[]), &[1.0, 0.0, 0.0])
            .await
            .unwrap();
        assert_eq!(strict.len(), 2);
        assert!(strict.iter().all(|r| r.similarity >= 0.9));

        let capped = store
            .search(&query(1, 0.0, &[]), &[1.0, 0.0, 0.0])
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].chunk.ordinal, 0);
    }

    #[tokio::test]
    async fn test_ties_break_by_path_then_ordinal() {
        let (_dir, store) = temp_store(3);
        let v = [0.5, 0.5, 0.0];
        insert(&store, "b.txt", &[v, v]).await;
        insert(&store, "a.txt", &[v]).await;

        let results = store.search(&query(10, 0.0, &[]), &v).await.unwrap();
        let order: Vec<(String, usize)> = results
            .iter()
            .map(|r| (r.chunk.document_path.clone(), r.chunk.ordinal))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a.txt".to_string(), 0),
                ("b.txt".to_string(), 0),
                ("b.txt".to_string(), 1)
            ]
        );
    }

    #[tokio::test]
    async fn test_file_filters() {
        let (_dir, store) = temp_store(3);
        let v = [0.1, 0.2, 0.3];
        insert(&store, "docs/a.md", &[v]).await;
        insert(&store, "src/b.rs", &[v]).await;
        insert(&store, "docs/nested/c.md", &[v]).await;

        let docs = store.search(&query(10, 0.0, &["docs/"]), &v).await.unwrap();
        assert_eq!(docs.len(), 2);

        let either = store
            .search(&query(10, 0.0, &["b.rs", "c.md"]), &v)
            .await
            .unwrap();
        assert_eq!(either.len(), 2);

        // Empty filter strings are ignored
        let all = store.search(&query(10, 0.0, &[""]), &v).await.unwrap();
        assert_eq!(all.len(), 3);

        let none = store.search(&query(10, 0.0, &["nope"]), &v).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_queries() {
        let (_dir, store) = temp_store(3);
        assert!(matches!(
            store.search(&query(0, 0.0, &[]), &[1.0, 0.0, 0.0]).await,
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(matches!(
            store.search(&query(1, 0.0, &[]), &[1.0, 0.0]).await,
            Err(StoreError::DimensionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_removed_document_is_not_returned() {
        let (_dir, store) = temp_store(3);
        insert(&store, "gone.txt", &[[1.0, 0.0, 0.0]]).await;
        store.remove_document("gone.txt").await.unwrap();
        let results = store
            .search(&query(5, 0.0, &[]), &[1.0, 0.0, 0.0])
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_search_never_mixes_generations() {
        let (_dir, store) = temp_store(3);
        let store = Arc::new(store);

        let generation = |g: usize| -> Vec<NewChunk> {
            (0..8)
                .map(|i| NewChunk {
                    ordinal: i,
                    text: format!("gen{g}"),
                    embedding: vec![1.0, i as f32 * 0.01, 0.0],
                })
                .collect()
        };
        store
            .index_document(meta("shared.txt"), generation(0))
            .await
            .unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for g in 1..40 {
                    store
                        .index_document(meta("shared.txt"), generation(g))
                        .await
                        .unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..3 {
            let store = store.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..40 {
                    let results = store
                        .search(&query(100, 0.0, &[]), &[1.0, 0.0, 0.0])
                        .await
                        .unwrap();
                    assert_eq!(results.len(), 8, "saw a partial chunk set");
                    let first = &results[0].chunk.text;
                    assert!(
                        results.iter().all(|r| &r.chunk.text == first),
                        "saw chunks from two generations"
                    );
                }
            }));
        }

        writer.await.unwrap();
        for r in readers {
            r.await.unwrap();
        }
    }
}
