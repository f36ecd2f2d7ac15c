// # Header Name Dictionary
//
// Header names are interned into a process-global table so header
// lookups compare small ids instead of strings. The table is
// pre-seeded with the names the engine itself touches; unknown names
// are added on first sight.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Interned header name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameId(pub u32);

/// A concurrent, insert-only name-interning table. Lookup is
/// case-insensitive; the canonical spelling is the first one seen.
pub struct NameTable {
    ids: DashMap<String, NameId>,
    names: RwLock<Vec<String>>,
}

impl NameTable {
    pub fn new() -> Self {
        Self {
            ids: DashMap::new(),
            names: RwLock::new(Vec::new()),
        }
    }

    /// Intern `name`, returning its id.
    pub fn intern(&self, name: &str) -> NameId {
        let key = name.to_ascii_lowercase();
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }

        let mut names = self.names.write();
        // Re-check under the writer lock; another thread may have won.
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        let id = NameId(names.len() as u32);
        names.push(name.to_string());
        self.ids.insert(key, id);
        id
    }

    /// Look up without inserting.
    pub fn find(&self, name: &str) -> Option<NameId> {
        self.ids.get(&name.to_ascii_lowercase()).map(|id| *id)
    }

    /// Canonical spelling for an id.
    pub fn name(&self, id: NameId) -> Option<String> {
        self.names.read().get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NameTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Names every header block starts out knowing.
pub const BUILT_IN_NAMES: &[&str] = &[
    "Date",
    "Content-Length",
    "Content-Type",
    "Location",
    "Host",
    "Connection",
    "Transfer-Encoding",
    "User-Agent",
    "Accept",
    "Accept-Language",
];

static GLOBAL_NAMES: Lazy<NameTable> = Lazy::new(|| {
    let table = NameTable::new();
    for name in BUILT_IN_NAMES {
        table.intern(name);
    }
    table
});

/// The process-global dictionary shared by every header block.
pub fn global_names() -> &'static NameTable {
    &GLOBAL_NAMES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_case_insensitive() {
        let table = NameTable::new();
        let a = table.intern("Content-Length");
        let b = table.intern("content-length");
        let c = table.intern("CONTENT-LENGTH");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(table.len(), 1);
        // Canonical spelling is the first seen.
        assert_eq!(table.name(a).as_deref(), Some("Content-Length"));
    }

    #[test]
    fn test_distinct_names_get_distinct_ids() {
        let table = NameTable::new();
        let a = table.intern("Date");
        let b = table.intern("Location");
        assert_ne!(a, b);
        assert_eq!(table.find("date"), Some(a));
        assert_eq!(table.find("never-seen"), None);
    }

    #[test]
    fn test_global_table_is_seeded() {
        let names = global_names();
        for name in BUILT_IN_NAMES {
            assert!(names.find(name).is_some(), "{} should be seeded", name);
        }
    }
}
