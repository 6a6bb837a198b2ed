use std::{fmt::Display, future::Future, sync::Arc};

use futures::{FutureExt, future::BoxFuture};

use crate::{
    model::{Resource, ResourceContents},
    service::RequestContext,
};

pub type DynReadResourceHandler = dyn Fn(String, RequestContext) -> BoxFuture<'static, Result<Vec<ResourceContents>, String>>
    + Send
    + Sync;

/// A readable resource, keyed by its URI.
#[derive(Clone)]
pub struct ResourceRoute {
    pub attr: Resource,
    pub read: Arc<DynReadResourceHandler>,
}

impl std::fmt::Debug for ResourceRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRoute")
            .field("uri", &self.attr.uri)
            .field("name", &self.attr.name)
            .finish()
    }
}

impl ResourceRoute {
    pub fn new<F, Fut, E>(uri: impl Into<String>, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(String, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ResourceContents>, E>> + Send + 'static,
        E: Display,
    {
        Self {
            attr: Resource::new(uri, name),
            read: Arc::new(move |uri, context| {
                handler(uri, context)
                    .map(|result| result.map_err(|e| e.to_string()))
                    .boxed()
            }),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.attr = self.attr.with_description(description);
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.attr = self.attr.with_mime_type(mime_type);
        self
    }

    pub fn uri(&self) -> &str {
        &self.attr.uri
    }
}
