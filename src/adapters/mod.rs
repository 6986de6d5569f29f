pub mod etcd;
pub mod http_client;
pub mod middleware;
pub mod proxy;

pub use etcd::EtcdRegistry;
pub use http_client::HttpClientAdapter;
pub use proxy::ProxyHandler;
