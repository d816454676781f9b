pub mod connection;
pub mod dispatcher;
pub mod metrics;

pub use dispatcher::{Delivery, DeliveryError, DeliveryReport, Dispatcher, DispatcherConfig, Subscription};
pub use metrics::Metrics;
