pub mod entities;
pub mod http_object_storage;
pub mod metrics;
pub mod pg_listener;
pub mod pg_outbox;
pub mod pg_storage;
