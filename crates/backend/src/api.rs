//! REST API client for the planning server.
//!
//! Wraps the planning HTTP endpoints (items, lock/unlock, featured lock,
//! autosave resources) using [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use planning_core::canonical::SERVER_MANAGED_KEYS;
use planning_core::item::{ItemType, LockableItem};
use planning_core::locks::Lock;
use planning_core::types::{Payload, Timestamp};
use reqwest::header::IF_MATCH;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backend::Backend;
use crate::error::BackendError;

/// Featured-stories lock singleton resource.
const FEATURED_LOCK: &str = "planning_featured_lock";
const FEATURED_UNLOCK: &str = "planning_featured_unlock";

/// Page size for lock and autosave queries.
const MAX_RESULTS: u32 = 200;

/// HTTP client for one planning server.
pub struct PlanningApi {
    client: reqwest::Client,
    api_url: String,
    auth_token: Option<String>,
}

/// Eve-style list envelope.
#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(rename = "_items")]
    items: Vec<T>,
}

/// Document stored by the featured-stories lock resource.
#[derive(Debug, Deserialize)]
struct FeaturedLockDoc {
    lock_user: Option<String>,
    lock_session: Option<String>,
    #[serde(default, with = "planning_core::canonical::opt_datetime")]
    lock_time: Option<Timestamp>,
}

impl FeaturedLockDoc {
    fn into_lock(self) -> Option<Lock> {
        let mut lock = Lock::featured(self.lock_user?, self.lock_session.unwrap_or_default());
        lock.time = self.lock_time;
        Some(lock)
    }
}

impl PlanningApi {
    /// Create a client for a planning server.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `https://planning.example.com/api`.
    pub fn new(api_url: String, auth_token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self::with_client(client, api_url, auth_token)
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String, auth_token: Option<String>) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    // ---- private helpers ----

    fn request(&self, method: Method, path: &str, etag: Option<&str>) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}/{}", self.api_url, path));
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(etag) = etag {
            builder = builder.header(IF_MATCH, etag);
        }
        builder
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`BackendError::Api`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), BackendError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// Decode an item document. Bookkeeping keys other than `_etag` are
/// dropped so they never reach the item payload.
fn item_from_document(mut document: Payload) -> Result<LockableItem, BackendError> {
    document.retain(|key, _| key == "_etag" || !SERVER_MANAGED_KEYS.contains(&key.as_str()));
    Ok(serde_json::from_value(Value::Object(document))?)
}

/// Overlay a (possibly partial) write response onto the document that was
/// sent, so callers always get a complete record back.
fn merge_response(sent: &Payload, response: Payload) -> Payload {
    let mut merged = sent.clone();
    merged.extend(response);
    merged
}

#[async_trait]
impl Backend for PlanningApi {
    async fn get_item(&self, item_type: ItemType, id: &str) -> Result<LockableItem, BackendError> {
        let response = self
            .request(Method::GET, &format!("{}/{id}", item_type.resource()), None)
            .send()
            .await?;
        item_from_document(Self::parse_response(response).await?)
    }

    async fn save_item(
        &self,
        original: &LockableItem,
        updates: &Payload,
    ) -> Result<LockableItem, BackendError> {
        let path = format!("{}/{}", original.item_type.resource(), original.id);
        let response = self
            .request(Method::PATCH, &path, original.etag.as_deref())
            .json(updates)
            .send()
            .await?;
        let response: Payload = Self::parse_response(response).await?;

        let mut sent = match serde_json::to_value(original)? {
            Value::Object(doc) => doc,
            _ => Payload::new(),
        };
        sent.extend(updates.clone());
        item_from_document(merge_response(&sent, response))
    }

    async fn lock_item(
        &self,
        item_type: ItemType,
        id: &str,
        etag: Option<&str>,
        action: &str,
    ) -> Result<LockableItem, BackendError> {
        let path = format!("{}/{id}", item_type.lock_endpoint());
        let response = self
            .request(Method::POST, &path, etag)
            .json(&json!({ "lock_action": action }))
            .send()
            .await?;
        item_from_document(Self::parse_response(response).await?)
    }

    async fn unlock_item(
        &self,
        item_type: ItemType,
        id: &str,
        etag: Option<&str>,
    ) -> Result<LockableItem, BackendError> {
        let path = format!("{}/{id}", item_type.unlock_endpoint());
        let response = self
            .request(Method::POST, &path, etag)
            .json(&json!({}))
            .send()
            .await?;
        item_from_document(Self::parse_response(response).await?)
    }

    async fn query_locked(&self, item_type: ItemType) -> Result<Vec<LockableItem>, BackendError> {
        let filter = json!({ "lock_user": { "$ne": null } }).to_string();
        let response = self
            .request(Method::GET, item_type.resource(), None)
            .query(&[("where", filter), ("max_results", MAX_RESULTS.to_string())])
            .send()
            .await?;
        let list: ItemList<Payload> = Self::parse_response(response).await?;
        list.items.into_iter().map(item_from_document).collect()
    }

    async fn get_featured_lock(&self) -> Result<Option<Lock>, BackendError> {
        let response = self.request(Method::GET, FEATURED_LOCK, None).send().await?;
        let list: ItemList<FeaturedLockDoc> = Self::parse_response(response).await?;
        Ok(list.items.into_iter().find_map(FeaturedLockDoc::into_lock))
    }

    async fn lock_featured(&self) -> Result<Lock, BackendError> {
        let response = self
            .request(Method::POST, FEATURED_LOCK, None)
            .json(&json!({}))
            .send()
            .await?;
        let doc: FeaturedLockDoc = Self::parse_response(response).await?;
        doc.into_lock().ok_or_else(|| BackendError::Api {
            status: 500,
            body: json!({ "_message": "Featured stories lock response has no lock user" })
                .to_string(),
        })
    }

    async fn unlock_featured(&self) -> Result<(), BackendError> {
        let response = self
            .request(Method::POST, FEATURED_UNLOCK, None)
            .json(&json!({}))
            .send()
            .await?;
        Self::check_status(response).await
    }

    async fn query_autosaves(
        &self,
        resource: &str,
        user: &str,
    ) -> Result<Vec<Payload>, BackendError> {
        let filter = json!({ "lock_user": user }).to_string();
        let response = self
            .request(Method::GET, resource, None)
            .query(&[("where", filter), ("max_results", MAX_RESULTS.to_string())])
            .send()
            .await?;
        let list: ItemList<Payload> = Self::parse_response(response).await?;
        Ok(list.items)
    }

    async fn get_autosave(&self, resource: &str, id: &str) -> Result<Payload, BackendError> {
        let response = self
            .request(Method::GET, &format!("{resource}/{id}"), None)
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn create_autosave(
        &self,
        resource: &str,
        document: &Payload,
    ) -> Result<Payload, BackendError> {
        let response = self
            .request(Method::POST, resource, None)
            .json(document)
            .send()
            .await?;
        let response: Payload = Self::parse_response(response).await?;
        Ok(merge_response(document, response))
    }

    async fn update_autosave(
        &self,
        resource: &str,
        id: &str,
        etag: &str,
        document: &Payload,
    ) -> Result<Payload, BackendError> {
        let response = self
            .request(Method::PUT, &format!("{resource}/{id}"), Some(etag))
            .json(document)
            .send()
            .await?;
        let response: Payload = Self::parse_response(response).await?;
        Ok(merge_response(document, response))
    }

    async fn delete_autosave(
        &self,
        resource: &str,
        id: &str,
        etag: &str,
    ) -> Result<(), BackendError> {
        let response = self
            .request(Method::DELETE, &format!("{resource}/{id}"), Some(etag))
            .send()
            .await?;
        Self::check_status(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = PlanningApi::with_client(
            reqwest::Client::new(),
            "http://localhost:5000/api/".into(),
            None,
        );
        assert_eq!(api.api_url(), "http://localhost:5000/api");
    }

    #[test]
    fn write_response_overrides_sent_fields() {
        let sent = json!({"_id": "p1", "slugline": "Storm"});
        let response = json!({"_etag": "d2", "_status": "OK"});

        let merged = merge_response(
            sent.as_object().unwrap(),
            response.as_object().cloned().unwrap(),
        );

        assert_eq!(merged["_id"], "p1");
        assert_eq!(merged["slugline"], "Storm");
        assert_eq!(merged["_etag"], "d2");
    }

    #[test]
    fn bookkeeping_keys_stay_out_of_item_fields() {
        let doc = json!({
            "_id": "e1",
            "type": "event",
            "_etag": "t3",
            "_status": "OK",
            "_links": {"self": {"href": "events/e1"}},
            "_updated": "2026-10-19T10:00:00+0000",
            "name": "Storm",
        });

        let item = item_from_document(doc.as_object().cloned().unwrap()).unwrap();

        assert_eq!(item.etag.as_deref(), Some("t3"));
        assert_eq!(item.fields.get("name"), Some(&json!("Storm")));
        for key in ["_status", "_links", "_updated", "_etag"] {
            assert!(!item.fields.contains_key(key), "{key} leaked into fields");
        }
    }

    #[test]
    fn featured_doc_without_user_is_not_a_lock() {
        let doc: FeaturedLockDoc = serde_json::from_value(json!({"lock_user": null})).unwrap();
        assert!(doc.into_lock().is_none());

        let doc: FeaturedLockDoc =
            serde_json::from_value(json!({"lock_user": "u1", "lock_session": "s1"})).unwrap();
        let lock = doc.into_lock().unwrap();
        assert_eq!(lock.session, "s1");
    }
}
