use std::collections::HashMap;

use kilroy_types::KilroyError;

use crate::{DynProvider, ProviderAdapter, Request, Response};

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

pub trait Middleware: Send + Sync {
    fn before(&self, _request: &mut Request) {}
    fn after(&self, _request: &Request, _response: &mut Response) {}
}

pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn before(&self, request: &mut Request) {
        tracing::info!(
            provider = %request.provider,
            model = %request.model,
            messages = request.messages.len(),
            "LLM request"
        );
    }

    fn after(&self, _request: &Request, response: &mut Response) {
        tracing::info!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            finish = ?response.finish_reason,
            "LLM response"
        );
    }
}

// ---------------------------------------------------------------------------
// Client — provider registry + completion dispatch
// ---------------------------------------------------------------------------

pub struct Client {
    providers: HashMap<String, DynProvider>,
    middleware: Vec<Box<dyn Middleware>>,
}

impl Client {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            middleware: Vec::new(),
        }
    }

    pub fn register(&mut self, provider: impl ProviderAdapter + 'static) {
        let name = provider.name().to_string();
        self.providers.insert(name, DynProvider::new(provider));
    }

    pub fn with_middleware(mut self, mw: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(mw));
        self
    }

    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Dispatch a completion to the provider named in the request. The model
    /// falls back to the provider's default when left empty.
    pub async fn complete(&self, request: Request) -> kilroy_types::Result<Response> {
        let provider =
            self.providers
                .get(&request.provider)
                .ok_or_else(|| KilroyError::ConfigError(format!(
                    "no provider registered under {:?}",
                    request.provider
                )))?;

        let mut request = request;
        if request.model.is_empty() {
            request.model = provider.default_model().to_string();
        }
        for mw in &self.middleware {
            mw.before(&mut request);
        }

        let mut response = provider.complete(&request).await?;
        for mw in &self.middleware {
            mw.after(&request, &mut response);
        }
        Ok(response)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FinishReason, Message, Usage};
    use async_trait::async_trait;

    struct MockProvider;

    #[async_trait]
    impl ProviderAdapter for MockProvider {
        async fn complete(&self, request: &Request) -> kilroy_types::Result<Response> {
            Ok(Response {
                id: "mock-1".into(),
                text: format!("echo: {}", request.messages.last().unwrap().content),
                model: request.model.clone(),
                usage: Usage::default(),
                finish_reason: FinishReason::EndTurn,
            })
        }

        fn name(&self) -> &str {
            "mock"
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }
    }

    #[tokio::test]
    async fn complete_routes_to_registered_provider() {
        let mut client = Client::new();
        client.register(MockProvider);

        let mut req = Request::new("mock", "");
        req.messages.push(Message::user("hello"));
        let resp = client.complete(req).await.unwrap();
        assert_eq!(resp.text, "echo: hello");
        // Empty model falls back to the provider default.
        assert_eq!(resp.model, "mock-model");
    }

    #[tokio::test]
    async fn complete_unknown_provider_errors() {
        let client = Client::new();
        let mut req = Request::new("nope", "m");
        req.messages.push(Message::user("hi"));
        let err = client.complete(req).await.unwrap_err();
        assert!(err.to_string().contains("no provider registered"));
    }
}
