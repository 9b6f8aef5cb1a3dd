pub mod ban_cache;
pub mod sqlite;
