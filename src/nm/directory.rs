//! File Directory
//!
//! Maps each file to its primary storage server, replica set and access
//! metadata. Lookups of the primary go through a small most-recently-used
//! cache sitting in front of the map; mutation keeps both coherent.

use std::collections::{HashMap, VecDeque};

use super::types::DirectoryEntry;

const CACHE_CAP: usize = 64;

#[derive(Debug, Default)]
pub struct DirectoryStore {
    entries: HashMap<String, DirectoryEntry>,
    /// MRU-ordered primary cache, most recent at the front.
    cache: VecDeque<(String, u32)>,
}

impl DirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, file: &str) -> bool {
        self.entries.contains_key(file)
    }

    pub fn get(&self, file: &str) -> Option<&DirectoryEntry> {
        self.entries.get(file)
    }

    pub fn get_mut(&mut self, file: &str) -> Option<&mut DirectoryEntry> {
        self.entries.get_mut(file)
    }

    /// Primary for `file`, promoting a cache hit; misses consult the map
    /// and populate the cache.
    pub fn primary(&mut self, file: &str) -> Option<u32> {
        if let Some(pos) = self.cache.iter().position(|(k, _)| k == file) {
            let hit = self.cache.remove(pos).unwrap();
            let primary = hit.1;
            self.cache.push_front(hit);
            return Some(primary);
        }
        let primary = self.entries.get(file)?.primary;
        self.cache_insert(file, primary);
        Some(primary)
    }

    fn cache_insert(&mut self, file: &str, primary: u32) {
        self.cache.push_front((file.to_string(), primary));
        if self.cache.len() > CACHE_CAP {
            self.cache.pop_back();
        }
    }

    fn cache_drop(&mut self, file: &str) {
        self.cache.retain(|(k, _)| k != file);
    }

    /// Upsert the mapping, preserving replica set and metadata when the
    /// file is already known.
    pub fn set_primary(&mut self, file: &str, primary: u32) {
        let entry = self
            .entries
            .entry(file.to_string())
            .or_insert_with(|| DirectoryEntry::new(primary));
        entry.primary = primary;
        entry.replicas.retain(|&r| r != primary);
        self.cache_drop(file);
        self.cache_insert(file, primary);
    }

    /// Replace the replica set, filtering the primary and duplicates.
    pub fn set_replicas(&mut self, file: &str, replicas: Vec<u32>) {
        if let Some(entry) = self.entries.get_mut(file) {
            let mut seen = Vec::new();
            for r in replicas {
                if r != entry.primary && !seen.contains(&r) {
                    seen.push(r);
                }
            }
            entry.replicas = seen;
        }
    }

    pub fn replicas(&self, file: &str) -> Vec<u32> {
        self.entries
            .get(file)
            .map(|e| e.replicas.clone())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, file: &str) -> Option<DirectoryEntry> {
        self.cache_drop(file);
        self.entries.remove(file)
    }

    /// Move an entry to a new key. `false` when the source is missing or
    /// the destination is taken.
    pub fn rename(&mut self, old_file: &str, new_file: &str) -> bool {
        if !self.entries.contains_key(old_file) || self.entries.contains_key(new_file) {
            return false;
        }
        let entry = self.entries.remove(old_file).unwrap();
        self.cache_drop(old_file);
        self.cache_insert(new_file, entry.primary);
        self.entries.insert(new_file.to_string(), entry);
        true
    }

    /// Rewrite every key under `old_path` to live under `new_path`.
    /// Returns `(old_name, new_name, primary)` per moved file.
    pub fn rename_prefix(&mut self, old_path: &str, new_path: &str) -> Vec<(String, String, u32)> {
        let affected: Vec<String> = self
            .entries
            .keys()
            .filter(|f| {
                f.as_str() == old_path
                    || (f.starts_with(old_path) && f.as_bytes().get(old_path.len()) == Some(&b'/'))
            })
            .cloned()
            .collect();

        let mut moved = Vec::new();
        for old_name in affected {
            let rest = &old_name[old_path.len()..];
            let new_name = if rest.is_empty() {
                new_path.to_string()
            } else {
                format!("{}/{}", new_path, rest.trim_start_matches('/'))
            };
            let entry = self.entries.remove(&old_name).unwrap();
            self.cache_drop(&old_name);
            moved.push((old_name, new_name.clone(), entry.primary));
            self.entries.insert(new_name, entry);
        }
        moved
    }

    pub fn files(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DirectoryEntry)> {
        self.entries.iter()
    }

    /// Mapping count per storage server, for least-loaded placement.
    pub fn load_counts(&self) -> HashMap<u32, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.primary).or_insert(0) += 1;
        }
        counts
    }
}
