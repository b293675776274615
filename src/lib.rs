#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts
)]

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::assets::{AssetDir, ByteProvider, MemoryAssets};
pub use application::dispatcher::Dispatcher;
pub use application::routes::RouteTable;
pub use domain::request::{Header, Method, Payload, Request, RequestId};
pub use domain::route::Route;
pub use infrastructure::config::ServerConfig;
pub use infrastructure::server_impl::response::{ResponseWriter, StatusCode};
pub use infrastructure::server_impl::server::{Server, ServerHandle};

pub type AnyResult<T> = eyre::Result<T>;
