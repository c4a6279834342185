pub mod lifo;
pub mod locks;
pub mod wait_queue;

/// Fixed-capacity task/object name.
pub type Name = heapless::String<64>;
