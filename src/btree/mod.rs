pub mod cursor;
pub mod foster;
pub mod page;
pub mod tree;

pub use cursor::Cursor;
pub use tree::BTree;
