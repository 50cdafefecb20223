//! Transparent request batching for generative-AI HTTP APIs.
//!
//! Application code keeps issuing ordinary per-request calls (chat
//! completions, embeddings, message generation) through the batchling HTTP
//! client. Inside a [`batched`] scope, requests that match a known
//! provider's batchable endpoint are grouped by `(provider, endpoint,
//! model)`, submitted through the provider's asynchronous batch API,
//! polled until completion, and resolved with per-request responses shaped
//! exactly like the synchronous endpoint's. The payoff is the batch-API
//! discount (about half price) in exchange for deferred completion.
//!
//! Requests that don't match a batchable endpoint, or that arrive outside
//! a scope, pass through to the network untouched.
//!
//! # Example
//! ```no_run
//! use batchling::{batched, BatchConfig, HttpClient, HttpRequest};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> batchling::Result<()> {
//!     batched(BatchConfig::default(), async {
//!         let client = batchling::client();
//!         let response = client
//!             .execute(HttpRequest::post_json(
//!                 "https://api.openai.com/v1/chat/completions",
//!                 &json!({
//!                     "model": "gpt-4o-mini",
//!                     "messages": [{"role": "user", "content": "Hello!"}],
//!                 }),
//!             ))
//!             .await?;
//!         println!("{}", response.text());
//!         Ok::<_, batchling::BatchlingError>(())
//!     })
//!     .await?
//! }
//! ```
//!
//! Previously submitted requests are remembered in a small per-user cache:
//! re-running the same script attaches to the original batches instead of
//! submitting again, which is also how [`BatchConfig::deferred`] exits
//! early and picks the work back up on the next run.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod fingerprint;
pub mod hook;
pub mod http;
pub mod providers;
pub mod types;

pub(crate) mod engine;

// Re-export the types that form the public surface: the scope constructor
// and its configuration, the hooked client, the HTTP abstraction, the
// provider trait for custom adapters, and the cache trait for custom
// persistence.
pub use config::BatchConfig;
pub use context::batched;
pub use error::{BatchlingError, Result};
pub use hook::{client, BatchingClient};
pub use http::{
    HttpClient, HttpRequest, HttpResponse, MockHttpClient, ReqwestHttpClient, DRY_RUN_HEADER,
    INTERNAL_HEADER,
};
pub use providers::{
    AnthropicProvider, BatchEndpoint, GeminiProvider, MistralProvider, OpenAiCompatProvider,
    PathPattern, PollStatus, PollTarget, Provider, ProviderRegistry, SubmitOutcome,
};

pub use cache::{CacheRow, InMemoryCache, RequestCache, SqliteCache};
pub use types::QueueKey;
