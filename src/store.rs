//! The process-wide, in-memory file store shared by the acceptor and the
//! workers.

use std::collections::HashMap;
use std::sync::Mutex;

/// Maps filenames to their stored lines.
///
/// The store is volatile and coarse-grained: one mutex serializes all
/// access, held only long enough to copy a value out or overwrite one.
/// A `get` racing a `put` on the same key sees either the old value, the
/// new value, or nothing; never a torn intermediate.
#[derive(Debug, Default)]
pub struct FileStore {
    files: Mutex<HashMap<String, Vec<String>>>,
}

impl FileStore {
    /// creates an empty store
    pub fn new() -> FileStore {
        FileStore {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// inserts `lines` under `name`, overwriting any existing entry whole
    pub fn put(&self, name: String, lines: Vec<String>) {
        let mut files = self.files.lock().expect("file store lock poisoned");
        files.insert(name, lines);
    }

    /// copies out the lines stored under `name`, or `None` if absent
    pub fn get(&self, name: &str) -> Option<Vec<String>> {
        let files = self.files.lock().expect("file store lock poisoned");
        files.get(name).cloned()
    }

    /// the number of stored files
    pub fn len(&self) -> usize {
        let files = self.files.lock().expect("file store lock poisoned");
        files.len()
    }

    /// true if nothing has been stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
