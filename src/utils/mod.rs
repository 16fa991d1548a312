mod log;
mod number;
mod other;

pub use self::log::init_log;
pub use number::ceil_div;
pub use other::HandyRwLock;
