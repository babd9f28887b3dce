pub mod broker;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod relay;
pub mod server;
pub mod store;

pub use broker::{AmqpBroker, Broker, BrokerError};
pub use cache::{CachedResponse, ResponseCache};
pub use config::{
    AppConfig, BrokerConfig, CacheConfig, InvalidationScope, JobsConfig, RedisConfig, ServerConfig,
};
pub use dispatcher::{DispatchError, JobDispatcher, JobMessage, JobTicket};
pub use error::ApiError;
pub use metrics::Metrics;
pub use observability::{LogFilter, init_tracing};
pub use relay::{RelayOutcome, StatusRelay};
pub use server::{AppState, CetasenseServer, ServerBuilder, build_app};
pub use store::{LocalStatusStore, RedisStatusStore, create_status_store};
