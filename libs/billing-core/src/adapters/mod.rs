pub mod in_memory_cache;
pub mod in_memory_event_bus;
pub mod in_memory_repository;
pub mod postgres_repository;

pub use in_memory_cache::InMemoryCache;
pub use in_memory_event_bus::InMemoryEventBus;
pub use in_memory_repository::InMemoryStore;
pub use postgres_repository::PostgresStore;
