//! Paginated portal endpoints.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};

use super::{parse_envelope, AuthContext, PortalClient, DOCUMENTS_PATH, TRANSACTIONS_PATH};
use crate::collect::{Cursor, Page};
use crate::error::SessionError;

/// A list endpoint the collector can page through.
#[async_trait]
pub trait PagedEndpoint: Send + Sync {
    /// Short name for logs and debug dump file names.
    fn name(&self) -> &'static str;

    fn page_size(&self) -> usize;

    /// Identity used to de-duplicate items across pages.
    fn item_key(&self, item: &Value) -> String;

    /// Cursor to continue after `item`, for responses without one.
    fn derive_cursor(&self, _item: &Value) -> Option<Cursor> {
        None
    }

    async fn fetch_page(
        &self,
        client: &PortalClient,
        ctx: &AuthContext,
        cursor: Option<&Cursor>,
    ) -> Result<Page<Value>, SessionError>;
}

/// Identity key from the first present field, else the whole item.
fn key_from(item: &Value, fields: &[&str]) -> String {
    fields
        .iter()
        .find_map(|f| match item.get(*f) {
            Some(Value::String(s)) if !s.is_empty() => Some(format!("{f}:{s}")),
            Some(Value::Number(n)) => Some(format!("{f}:{n}")),
            _ => None,
        })
        .unwrap_or_else(|| item.to_string())
}

/// Booked and pending transactions for one IBAN (`kontoumsaetze`).
///
/// Pages backwards through time with the `idBis` / `neuanlageBis` predicate
/// fields. When the server does not hand out a cursor, it is derived from the
/// `id` and `neuanlage` of the last transaction received.
#[derive(Debug, Clone)]
pub struct TransactionsEndpoint {
    pub iban: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub page_size: usize,
}

impl TransactionsEndpoint {
    pub fn new(iban: impl Into<String>, from: NaiveDate, to: NaiveDate, page_size: usize) -> Self {
        Self {
            iban: iban.into(),
            from,
            to,
            page_size,
        }
    }

    pub fn request_body(&self, cursor: Option<&Cursor>) -> Value {
        let cursor_field = |name: &str| {
            cursor
                .and_then(|c| c.get(name))
                .cloned()
                .unwrap_or(Value::Null)
        };
        json!({
            "predicate": {
                "buchungVon": format!("{}T00:00:00.000", self.from.format("%Y-%m-%d")),
                "buchungBis": format!("{}T23:59:59.999", self.to.format("%Y-%m-%d")),
                "neuanlageBis": cursor_field("neuanlageBis"),
                "idBis": cursor_field("idBis"),
                "betragVon": null,
                "betragBis": null,
                "betragsrichtung": "BEIDE",
                "kategorieCodes": null,
                "kategorieCodesNotIn": false,
                "hashtags": null,
                "ibans": [self.iban],
                "pending": true,
                "folgenummernKarteByIban": null,
            },
            "limit": self.page_size,
        })
    }
}

#[async_trait]
impl PagedEndpoint for TransactionsEndpoint {
    fn name(&self) -> &'static str {
        "transactions"
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn item_key(&self, item: &Value) -> String {
        key_from(item, &["id", "bestandreferenz", "ersterfasserreferenz"])
    }

    fn derive_cursor(&self, item: &Value) -> Option<Cursor> {
        let id = item.get("id").filter(|v| !v.is_null())?;
        let mut cursor = Cursor::new().with("idBis", id.clone());
        if let Some(created) = item.get("neuanlage").filter(|v| !v.is_null()) {
            cursor.set("neuanlageBis", created.clone());
        }
        Some(cursor)
    }

    async fn fetch_page(
        &self,
        client: &PortalClient,
        ctx: &AuthContext,
        cursor: Option<&Cursor>,
    ) -> Result<Page<Value>, SessionError> {
        let body = self.request_body(cursor);
        let value = client.post_json(ctx, TRANSACTIONS_PATH, &body).await?;
        client.dump("transactions-raw", &value);
        parse_envelope(value, &["kontoumsaetze", "items"])
    }
}

/// The document mailbox (`dokumente/filter`), paged by `skip`/`limit`.
#[derive(Debug, Clone)]
pub struct DocumentsEndpoint {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub page_size: usize,
}

impl DocumentsEndpoint {
    pub fn new(from: NaiveDate, to: NaiveDate, page_size: usize) -> Self {
        Self {
            from,
            to,
            page_size,
        }
    }

    pub fn request_body(&self, skip: u64) -> Value {
        json!({
            "von": format!("{}T00:00:00", self.from.format("%Y-%m-%d")),
            "bis": format!("{}T00:00:00", self.to.format("%Y-%m-%d")),
            "skip": skip,
            "limit": self.page_size,
        })
    }
}

#[async_trait]
impl PagedEndpoint for DocumentsEndpoint {
    fn name(&self) -> &'static str {
        "documents"
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn item_key(&self, item: &Value) -> String {
        key_from(item, &["id", "dokumentId", "documentId"])
    }

    async fn fetch_page(
        &self,
        client: &PortalClient,
        ctx: &AuthContext,
        cursor: Option<&Cursor>,
    ) -> Result<Page<Value>, SessionError> {
        let skip = cursor.and_then(|c| c.get_u64("skip")).unwrap_or(0);
        let value = client
            .post_json(ctx, DOCUMENTS_PATH, &self.request_body(skip))
            .await?;
        client.dump("documents-raw", &value);

        let mut page = parse_envelope(value, &["dokumente", "items", "data"])?;
        if page.next_cursor.is_none() && !page.items.is_empty() {
            let next = skip + page.items.len() as u64;
            page.next_cursor = Some(Cursor::new().with("skip", next));
        }
        Ok(page)
    }
}
