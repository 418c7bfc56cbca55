pub mod changes;
pub mod error;
pub mod executable_utils;
pub mod image;
pub mod model;
pub mod object_store;
pub mod order_service;
pub mod outbox;
pub mod projection;
pub mod replacement;
pub mod reviews;
pub mod status;
pub mod storage;
