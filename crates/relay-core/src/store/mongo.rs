//! MongoDB record store.
//!
//! Filters become `$or` / equality / escaped `$regex` queries; document ids
//! are ObjectId hex strings or plain string ids. Bodies are exposed as
//! canonical extended JSON and patches are parsed back from it, so dates,
//! ObjectIds and integer widths survive a read-modify-write.

use super::{Document, Filter, Patch, RecordStore, UpdateResult};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, Document as BsonDocument};
use futures::TryStreamExt;
use mongodb::{Client, Collection, Database};
use serde_json::Value;
use tracing::{debug, info};

fn db_error(context: &str, err: impl std::fmt::Display) -> RelayError {
    RelayError::Database {
        message: format!("{}: {}", context, err),
    }
}

/// Record store backed by one MongoDB database.
#[derive(Clone)]
pub struct MongoRecordStore {
    db: Database,
}

impl MongoRecordStore {
    /// Connect and verify the connection with a ping.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB database '{}'", db_name);

        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| db_error("Failed to connect to MongoDB", e))?;
        let db = client.database(db_name);

        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| db_error("MongoDB ping failed", e))?;

        info!("Connected to MongoDB database '{}'", db_name);
        Ok(Self { db })
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.db.collection::<BsonDocument>(name)
    }
}

/// Translate a filter into a MongoDB query document.
///
/// Returns `None` for an empty `Any`, which matches nothing.
pub fn to_query(filter: &Filter) -> Result<Option<BsonDocument>> {
    match filter {
        Filter::Eq(field, value) => {
            let value = to_bson_value(value)?;
            let mut query = BsonDocument::new();
            query.insert(field.clone(), value);
            Ok(Some(query))
        }
        Filter::Contains(field, needle) => {
            if needle.is_empty() {
                return Ok(None);
            }
            let mut query = BsonDocument::new();
            query.insert(field.clone(), doc! { "$regex": regex::escape(needle) });
            Ok(Some(query))
        }
        Filter::Any(filters) => {
            let mut clauses = Vec::new();
            for f in filters {
                if let Some(q) = to_query(f)? {
                    clauses.push(Bson::Document(q));
                }
            }
            if clauses.is_empty() {
                Ok(None)
            } else {
                Ok(Some(doc! { "$or": clauses }))
            }
        }
    }
}

/// `_id` filter for a document id produced by `into_document`.
fn id_query(id: &str) -> BsonDocument {
    match ObjectId::parse_str(id) {
        Ok(oid) => doc! { "_id": oid },
        Err(_) => doc! { "_id": id },
    }
}

/// Parse an extended JSON value back into its native BSON type.
fn to_bson_value(value: &Value) -> Result<Bson> {
    Bson::try_from(value.clone()).map_err(|e| db_error("Invalid extended JSON value", e))
}

/// `$set` document for a patch.
fn set_document(patch: &Patch) -> Result<BsonDocument> {
    let mut set = BsonDocument::new();
    for (field, value) in patch {
        set.insert(field.clone(), to_bson_value(value)?);
    }
    Ok(set)
}

fn into_document(mut raw: BsonDocument) -> Document {
    let id = match raw.remove("_id") {
        Some(Bson::ObjectId(oid)) => oid.to_hex(),
        Some(Bson::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let body = Bson::Document(raw).into_canonical_extjson();
    Document::new(id, body)
}

async fn collect(cursor: mongodb::Cursor<BsonDocument>) -> Result<Vec<Document>> {
    let raw: Vec<BsonDocument> = cursor
        .try_collect()
        .await
        .map_err(|e| db_error("Cursor iteration failed", e))?;
    Ok(raw.into_iter().map(into_document).collect())
}

#[async_trait]
impl RecordStore for MongoRecordStore {
    async fn find_by_filter(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        let Some(query) = to_query(filter)? else {
            return Ok(Vec::new());
        };
        debug!("find {} {}", collection, query);

        let cursor = self
            .collection(collection)
            .find(query)
            .await
            .map_err(|e| db_error("find failed", e))?;
        collect(cursor).await
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let found = self
            .collection(collection)
            .find_one(id_query(id))
            .await
            .map_err(|e| db_error("find_one failed", e))?;
        Ok(found.map(into_document))
    }

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: &Patch,
    ) -> Result<UpdateResult> {
        let set = set_document(patch)?;
        let res = self
            .collection(collection)
            .update_one(id_query(id), doc! { "$set": set })
            .await
            .map_err(|e| db_error("update_one failed", e))?;

        Ok(UpdateResult {
            matched_count: res.matched_count,
            modified_count: res.modified_count,
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = self
            .db
            .list_collection_names()
            .await
            .map_err(|e| db_error("listCollections failed", e))?;
        names.retain(|n| !n.starts_with("system."));
        names.sort();
        Ok(names)
    }

    async fn scan(&self, collection: &str) -> Result<Vec<Document>> {
        let cursor = self
            .collection(collection)
            .find(doc! {})
            .await
            .map_err(|e| db_error("find failed", e))?;
        collect(cursor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_contains_is_escaped_literal() {
        let query = to_query(&Filter::contains("image", "a.b(1)")).unwrap().unwrap();
        let regex = query
            .get_document("image")
            .unwrap()
            .get_str("$regex")
            .unwrap();
        assert_eq!(regex, r"a\.b\(1\)");
    }

    #[test]
    fn test_any_builds_or() {
        let filter = Filter::Any(vec![
            Filter::eq("imgId", "x"),
            Filter::contains("image", ""),
            Filter::contains("image", "x"),
        ]);
        let query = to_query(&filter).unwrap().unwrap();
        assert_eq!(query.get_array("$or").unwrap().len(), 2);
        assert!(to_query(&Filter::Any(Vec::new())).unwrap().is_none());
    }

    #[test]
    fn test_into_document_extracts_id() {
        let oid = ObjectId::new();
        let raw = doc! { "_id": oid, "image": "https://old/a.jpg" };
        let doc = into_document(raw);
        assert_eq!(doc.id, oid.to_hex());
        assert_eq!(doc.body, json!({"image": "https://old/a.jpg"}));
        assert_eq!(id_query(&doc.id), doc! { "_id": oid });
        assert_eq!(id_query("plain"), doc! { "_id": "plain" });
    }

    #[test]
    fn test_patch_keeps_native_bson_types() {
        let oid = ObjectId::new();
        let when = bson::DateTime::from_millis(1_700_000_000_123);
        let raw = doc! {
            "_id": oid,
            "meta": { "author": oid, "at": when, "views": 7_i64, "cover": "https://old/a.jpg" },
        };
        let doc = into_document(raw);

        let mut patch = Patch::new();
        patch.insert("meta".to_string(), doc.body["meta"].clone());
        patch.insert("image".to_string(), json!("https://new/a.jpg"));
        let set = set_document(&patch).unwrap();

        let meta = set.get_document("meta").unwrap();
        assert_eq!(meta.get_object_id("author").unwrap(), oid);
        assert_eq!(meta.get_datetime("at").unwrap(), &when);
        assert_eq!(meta.get_i64("views").unwrap(), 7);
        assert_eq!(set.get_str("image").unwrap(), "https://new/a.jpg");
    }

    #[test]
    fn test_eq_filter_parses_extended_json() {
        let oid = ObjectId::new();
        let query = to_query(&Filter::Eq("owner".to_string(), json!({ "$oid": oid.to_hex() })))
            .unwrap()
            .unwrap();
        assert_eq!(query, doc! { "owner": oid });
    }
}
