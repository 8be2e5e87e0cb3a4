mod in_memory_key_value_store;
mod key_value_notification_outbox;
mod key_value_pending_registration_repository;
mod key_value_profile_repository;
mod key_value_store;
mod sqlite_key_value_store;

pub use in_memory_key_value_store::*;
pub use key_value_notification_outbox::*;
pub use key_value_pending_registration_repository::*;
pub use key_value_profile_repository::*;
pub use key_value_store::*;
pub use sqlite_key_value_store::*;
