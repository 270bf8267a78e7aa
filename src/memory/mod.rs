pub mod pool;
pub mod shared;
