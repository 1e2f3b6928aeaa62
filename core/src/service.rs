//! Ready-made client wiring: a JSON header store and a client reading it.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;

use crate::client::{ApiClient, ClientConfig, FileUpload, Server401Hook};
use crate::error::ApiError;
use crate::headers::HeaderStore;
use crate::http::HttpResponse;
use crate::transport::Transport;
use crate::types::RequestDescription;

/// A header store seeded with `Content-Type: application/json` and an
/// `ApiClient` bound to it.
#[derive(Clone)]
pub struct CommonService {
    header_store: HeaderStore,
    client: ApiClient,
}

impl CommonService {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self::build(config, transport, None)
    }

    pub fn with_server_401_hook(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        hook: Server401Hook,
    ) -> Self {
        Self::build(config, transport, Some(hook))
    }

    fn build(config: ClientConfig, transport: Arc<dyn Transport>, hook: Option<Server401Hook>) -> Self {
        let header_store = HeaderStore::default();
        let mut builder = ApiClient::builder(config, transport).with_header_store(header_store.clone());
        if let Some(hook) = hook {
            builder = builder.with_server_401_hook(hook);
        }
        Self {
            header_store,
            client: builder.build(),
        }
    }

    pub fn header_store(&self) -> &HeaderStore {
        &self.header_store
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn call_api<R>(&self, request: RequestDescription) -> BoxFuture<'static, Result<R, ApiError>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        self.client.call_api(request)
    }

    pub fn call_api_stream<T>(&self, request: RequestDescription) -> BoxStream<'static, Result<T, ApiError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.client.call_api_stream(request)
    }

    pub fn upload_file(&self, upload: FileUpload) -> BoxFuture<'static, Result<HttpResponse, ApiError>> {
        self.client.upload_file(upload)
    }

    pub fn sse<T>(&self, request: RequestDescription) -> BoxStream<'static, T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.client.sse(request)
    }
}
