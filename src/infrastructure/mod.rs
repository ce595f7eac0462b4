pub mod cache;
pub mod exchanges;
pub mod mock;
pub mod rabbitmq;
pub mod resilience;
