//! Postgres-backed canonical store.

use super::{CanonicalStore, PageStream, StoreError};
use crate::page::{Page, Section};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, Mutex};
use tokio_postgres::{Client, NoTls, Row};

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS pages (
        id BIGSERIAL PRIMARY KEY,
        url TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        crawled_at TIMESTAMPTZ NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sections (
        page_id BIGINT NOT NULL REFERENCES pages (id) ON DELETE CASCADE,
        section_type TEXT NOT NULL,
        content TEXT NOT NULL,
        language TEXT,
        sort_order INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS sections_page_id_sort_order_idx
        ON sections (page_id, sort_order);
";

const UPSERT_PAGE_SQL: &str = "
    INSERT INTO pages (url, title, crawled_at)
    VALUES ($1, $2, $3)
    ON CONFLICT (url)
    DO UPDATE SET title = EXCLUDED.title, crawled_at = EXCLUDED.crawled_at
    RETURNING id";

const DELETE_SECTIONS_SQL: &str = "DELETE FROM sections WHERE page_id = $1";

const INSERT_SECTIONS_SQL: &str = "
    INSERT INTO sections (page_id, section_type, content, language, sort_order)
    SELECT $1, s.section_type, s.content, s.language, s.sort_order
    FROM UNNEST($2::text[], $3::text[], $4::text[], $5::int4[])
        AS s (section_type, content, language, sort_order)";

const SELECT_PAGE_SQL: &str = "SELECT id, url, title, crawled_at FROM pages WHERE url = $1";

const SELECT_SECTIONS_SQL: &str = "
    SELECT page_id, section_type, content, language
    FROM sections
    WHERE page_id = ANY($1)
    ORDER BY page_id, sort_order";

const SELECT_ALL_PAGES_SQL: &str = "SELECT id, url, title, crawled_at FROM pages ORDER BY id";

/// Canonical store over a small fixed set of Postgres connections.
pub struct PgStore {
    database_url: String,
    connections: Vec<Mutex<Client>>,
    cursor: AtomicUsize,
}

impl PgStore {
    /// Opens `connections` connections to `database_url`.
    pub async fn connect(database_url: &str, connections: usize) -> Result<Self, StoreError> {
        let mut clients = Vec::with_capacity(connections.max(1));
        for _ in 0..connections.max(1) {
            clients.push(Mutex::new(open(database_url).await?));
        }
        Ok(Self {
            database_url: database_url.to_string(),
            connections: clients,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Creates the `pages` and `sections` tables when missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let client = self.connection().lock().await;
        client.batch_execute(SCHEMA_SQL).await?;
        Ok(())
    }

    /// Drops every connection; their driver tasks exit once the clients are gone.
    pub fn close(self) {
        drop(self.connections);
    }

    fn connection(&self) -> &Mutex<Client> {
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        &self.connections[slot]
    }
}

async fn open(database_url: &str) -> Result<Client, StoreError> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .map_err(|err| StoreError::Unavailable(format!("failed to connect to Postgres: {err}")))?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::error!(error = %err, "postgres connection error");
        }
    });
    Ok(client)
}

#[async_trait]
impl CanonicalStore for PgStore {
    async fn save_page(&self, page: &Page) -> Result<i64, StoreError> {
        page.validate()?;

        let mut client = self.connection().lock().await;
        // Dropping the transaction without commit rolls it back.
        let transaction = client.transaction().await?;
        let row = transaction
            .query_one(UPSERT_PAGE_SQL, &[&page.url, &page.title, &page.crawled_at])
            .await?;
        let page_id: i64 = row.get(0);

        transaction.execute(DELETE_SECTIONS_SQL, &[&page_id]).await?;

        let kinds: Vec<&str> = page.sections.iter().map(|s| s.kind.as_str()).collect();
        let contents: Vec<&str> = page.sections.iter().map(|s| s.content.as_str()).collect();
        let languages: Vec<Option<&str>> = page
            .sections
            .iter()
            .map(|s| s.language.as_deref())
            .collect();
        let positions = (0..page.sections.len())
            .map(|pos| {
                i32::try_from(pos).map_err(|_| {
                    StoreError::Corrupt(format!("section position {pos} exceeds i32 range"))
                })
            })
            .collect::<Result<Vec<i32>, _>>()?;
        transaction
            .execute(
                INSERT_SECTIONS_SQL,
                &[&page_id, &kinds, &contents, &languages, &positions],
            )
            .await?;

        transaction.commit().await?;
        Ok(page_id)
    }

    async fn load_page(&self, url: &str) -> Result<Option<Page>, StoreError> {
        let client = self.connection().lock().await;
        let Some(row) = client.query_opt(SELECT_PAGE_SQL, &[&url]).await? else {
            return Ok(None);
        };
        let page_id: i64 = row.get("id");
        let section_rows = client.query(SELECT_SECTIONS_SQL, &[&vec![page_id]]).await?;
        let mut grouped = group_sections(&section_rows)?;
        Ok(Some(page_from_row(&row, grouped.remove(&page_id))))
    }

    async fn stream_pages(&self, batch_size: usize) -> Result<PageStream, StoreError> {
        let mut client = open(&self.database_url).await?;
        let (tx, stream) = PageStream::channel(batch_size);
        let batch_size = i32::try_from(batch_size.max(1)).unwrap_or(i32::MAX);
        tokio::spawn(async move {
            if let Err(err) = stream_into(&mut client, batch_size, &tx).await {
                let _ = tx.send(Err(err)).await;
            }
        });
        Ok(stream)
    }
}

async fn stream_into(
    client: &mut Client,
    batch_size: i32,
    tx: &mpsc::Sender<Result<Page, StoreError>>,
) -> Result<(), StoreError> {
    let transaction = client.build_transaction().read_only(true).start().await?;
    let portal = transaction.bind(SELECT_ALL_PAGES_SQL, &[]).await?;
    loop {
        let rows = transaction.query_portal(&portal, batch_size).await?;
        if rows.is_empty() {
            break;
        }
        let ids: Vec<i64> = rows.iter().map(|row| row.get("id")).collect();
        let section_rows = transaction.query(SELECT_SECTIONS_SQL, &[&ids]).await?;
        let mut grouped = group_sections(&section_rows)?;
        for row in &rows {
            let page_id: i64 = row.get("id");
            let page = page_from_row(row, grouped.remove(&page_id));
            if tx.send(Ok(page)).await.is_err() {
                return Ok(());
            }
        }
    }
    transaction.commit().await?;
    Ok(())
}

fn group_sections(rows: &[Row]) -> Result<HashMap<i64, Vec<Section>>, StoreError> {
    let mut grouped: HashMap<i64, Vec<Section>> = HashMap::new();
    for row in rows {
        let page_id: i64 = row.get("page_id");
        let kind: String = row.get("section_type");
        grouped.entry(page_id).or_default().push(Section {
            kind: kind.parse()?,
            content: row.get("content"),
            language: row.get("language"),
        });
    }
    Ok(grouped)
}

fn page_from_row(row: &Row, sections: Option<Vec<Section>>) -> Page {
    Page {
        url: row.get("url"),
        title: row.get("title"),
        sections: sections.unwrap_or_default(),
        crawled_at: row.get("crawled_at"),
    }
}
