//! Request clients.
//!
//! - [`ApiClient`]: one request at a time, with URL resolution, default
//!   headers and auth/before/after hooks
//! - [`AsyncApiClient`]: submits requests through a rate-paced
//!   [`WorkerScheduler`](crate::scheduler::WorkerScheduler) and retries failed ones
//! - [`GraphqlClient`] / [`GraphqlAsyncClient`]: GraphQL queries gated by a
//!   shared "rate remaining" counter

pub mod api_client;
pub mod async_client;
pub mod graphql;

pub use api_client::{
    AfterResponse, AfterResponseHook, ApiClient, BeforeRequestHook, Query, unmarshal,
};
pub use async_client::{AsyncApiClient, AsyncRequest, ResponseHandler};
pub use graphql::{
    GraphqlAsyncClient, GraphqlClient, GraphqlDataError, GraphqlResponse, RateRemaining,
};
