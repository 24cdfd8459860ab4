mod config;
mod edit;
mod error;
mod events;
mod forward;
mod intercept;
mod landing;
mod proxy;
mod wire;

pub use config::{
    HistoryConfig, InterceptConfig, ListenConfig, ProxyConfig, TlsConfig, UpstreamConfig,
};
pub use edit::RequestEdit;
pub use error::{InterceptError, ProxyError};
pub use events::{
    ChannelNotifier, NullNotifier, StoreEvent, StoreEvents, TransactionNotifier, event_channel,
};
pub use intercept::{Completion, CompletionWaiter, InterceptQueue, Resolution, Verdict};
pub use proxy::{DROP_STATUS, ProxyServer};
