pub mod admin;
pub mod health_checker;
pub mod http_client;
pub mod http_handler;
pub mod proxy;

pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
