//! foster-db: a transactional storage engine built around a Foster
//! B-tree index.
//!
//! The four load-bearing pieces are the tree-aware buffer pool
//! ([`buffer`]), the Foster B-tree ([`btree`]), the write-ahead log
//! ([`wal`]), and restart recovery ([`recovery`]); the [`engine`]
//! module wires them into the public [`Engine`] / [`Xct`] / [`Index`]
//! surface.
//!
//! ```no_run
//! use foster_db::{Engine, Options};
//!
//! let engine = Engine::open("data/db", Options::new(64)).unwrap();
//! let tx = engine.begin();
//! let store = tx.create_index().unwrap();
//! let index = tx.open_index(store).unwrap();
//! index.insert(&tx, b"k00001", b"v").unwrap();
//! tx.commit().unwrap();
//! ```

pub mod btree;
pub mod buffer;
pub mod engine;
pub mod error;
pub mod io;
pub mod recovery;
pub mod transaction;
pub mod types;
pub mod utils;
pub mod vol;
pub mod wal;

pub use engine::{Engine, Index, Options};
pub use error::{DbError, ErrorKind};
pub use transaction::{Xct, XctState};
pub use vol::{PageId, StoreId};
pub use wal::Lsn;
