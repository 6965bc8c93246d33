pub mod cpu;
pub mod dispatch;
pub mod ops;
pub mod pooling;
