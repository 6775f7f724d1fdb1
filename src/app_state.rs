use crate::backend::GenBackend;
use crate::io_struct::ConversationMessage;
use crate::store::{FsObjectStore, ObjectKey, StoreError};
use actix_web::HttpResponse;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: u64,
    pub store_root: PathBuf,
}

/// Shared handles for request handlers. Holds no per-request or
/// cross-request mutable state; every request is single-flight.
#[derive(Clone)]
pub struct AppState {
    pub backend: GenBackend,
    pub store: FsObjectStore,
}

impl AppState {
    pub async fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let backend = GenBackend::new(
            config.backend_url.clone(),
            config.api_key.clone(),
            config.model.clone(),
            config.timeout,
        )?;
        let store = FsObjectStore::open(config.store_root.clone()).await?;
        Ok(AppState { backend, store })
    }

    /// Relay one generation turn: forward the conversation to the backend and
    /// pipe its text deltas straight into the response body. Chunks are
    /// flushed as they arrive; backpressure propagates through the stream.
    /// A failure before the first byte surfaces as 502; a mid-stream failure
    /// just terminates the response stream.
    pub async fn relay_chat(
        &self,
        messages: &[ConversationMessage],
    ) -> Result<HttpResponse, actix_web::Error> {
        let stream = self
            .backend
            .stream_text(messages)
            .await
            .map_err(actix_web::error::ErrorBadGateway)?;
        let body = stream.map(|r| r.map_err(actix_web::error::ErrorBadGateway));
        Ok(HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .streaming(body))
    }

    /// Ingest one upload: generate a fresh key, stream the payload into the
    /// store, and hand the key back only after the store has committed.
    pub async fn ingest<S, E>(
        &self,
        content_type: Option<String>,
        payload: S,
    ) -> Result<ObjectKey, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: fmt::Display,
    {
        let key = ObjectKey::generate();
        self.store.put_stream(&key, content_type, payload).await?;
        Ok(key)
    }
}
