// Store side of the messaging core: the store contract, its implementations,
// and the resolver/writer operations that run against it
pub mod config;
pub mod database;
pub mod memory;
pub mod messages;
pub mod redis_relay;
pub mod resolver;
pub mod store;
