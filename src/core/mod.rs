pub mod cursor;
pub mod db;
pub mod errors;
pub mod helpers;
pub mod spin_kv;
