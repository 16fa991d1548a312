#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use foster_db::{Engine, Options};

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

pub fn setup() {
    foster_db::utils::init_log();
}

/// A fresh directory for one engine instance.
pub fn test_dir(name: &str) -> PathBuf {
    let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "foster-test-{}-{}-{}",
        name,
        std::process::id(),
        seq
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn open_engine(dir: &PathBuf, frames: usize) -> Engine {
    Engine::open(dir, Options::new(frames)).unwrap()
}

/// Options tuned for crash tests: no background writer, so a dropped
/// engine leaves exactly the state the test arranged.
pub fn crash_options(frames: usize) -> Options {
    let mut options = Options::new(frames);
    options.background_flush = false;
    options
}

pub fn key(i: usize) -> Vec<u8> {
    format!("k{:05}", i).into_bytes()
}

pub fn value(i: usize, len: usize) -> Vec<u8> {
    let mut v = format!("v{:05}-", i).into_bytes();
    while v.len() < len {
        v.push(b'x');
    }
    v.truncate(len);
    v
}
