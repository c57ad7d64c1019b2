//! Recipient resolution, transactional enqueueing and message lifecycle.

pub mod election;
pub mod enqueuer;
pub mod gc;
pub mod ids;
pub mod messages;
pub mod preferences;
pub mod store;
pub mod strategies;
