mod device_channel;
mod device_exchange;
mod device_reply;
mod engine_config;
mod enrollment_service;
mod id_allocator;
mod image_preparer;
mod payload_builder;
mod queue_processor;
mod queue_store;
mod result_sink;

pub use device_channel::*;
pub use device_exchange::*;
pub use device_reply::*;
pub use engine_config::*;
pub use enrollment_service::*;
pub use id_allocator::*;
pub use image_preparer::*;
pub use payload_builder::*;
pub use queue_processor::*;
pub use queue_store::*;
pub use result_sink::*;
