//! Streaming cache (C9): content-addressed reuse of completed streams,
//! keyed by a fingerprint over the cache-relevant request fields.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::{Duration, Instant},
};

use sha2::{Digest, Sha256};

use crate::messages::unified::{UnifiedChunk, UnifiedRequest};

const MESSAGE_CONTENT_KEY_BOUND: usize = 1024;
const MIN_CHUNKS_TO_CACHE: usize = 5;
const MAX_CHUNKS_TO_CACHE: usize = 1000;
const MIN_CONTENT_CHUNKS: usize = 3;
const MIN_CONTENT_CHARS: usize = 50;

pub(crate) type Fingerprint = String;

/// Computes the SHA-256 fingerprint over the fields that determine cache
/// identity. Deterministic: equal requests under these fields always
/// produce the same fingerprint.
pub(crate) fn fingerprint(request: &UnifiedRequest) -> Fingerprint {
    let mut hasher = Sha256::new();

    hasher.update(request.model.as_bytes());

    for message in &request.messages {
        let key_material = match &message.content {
            crate::messages::unified::UnifiedContentContainer::Text(text) => {
                bound(text, MESSAGE_CONTENT_KEY_BOUND)
            }
            crate::messages::unified::UnifiedContentContainer::Blocks(blocks) => {
                let joined = blocks
                    .iter()
                    .filter_map(|block| block.as_text())
                    .collect::<Vec<_>>()
                    .join("\n");
                bound(&joined, MESSAGE_CONTENT_KEY_BOUND)
            }
        };
        hasher.update(format!("{:?}", message.role).as_bytes());
        hasher.update(key_material.as_bytes());
    }

    if let Some(tools) = &request.tools {
        for tool in tools {
            hasher.update(tool.function.name.as_bytes());
            if let Some(description) = &tool.function.description {
                hasher.update(bound(description, 64).as_bytes());
            }
        }
    }

    if let Some(max_tokens) = request.max_tokens {
        hasher.update(max_tokens.to_be_bytes());
    }
    if let Some(temperature) = request.temperature {
        hasher.update(temperature.to_be_bytes());
    }
    hasher.update([request.stream.unwrap_or(false) as u8]);

    format!("{:x}", hasher.finalize())
}

fn bound(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        text.to_string()
    } else {
        text.chars().take(max_bytes).collect()
    }
}

/// Whether an accumulated chunk sequence is worth storing.
pub(crate) fn is_cacheable(chunks: &[UnifiedChunk]) -> bool {
    if chunks.is_empty() || chunks.len() < MIN_CHUNKS_TO_CACHE || chunks.len() > MAX_CHUNKS_TO_CACHE {
        return false;
    }

    let mut content_chunks = 0usize;
    let mut content_chars = 0usize;
    let mut has_tool_call = false;

    for chunk in chunks {
        for choice in &chunk.choices {
            if let Some(text) = &choice.delta.content {
                content_chunks += 1;
                content_chars += text.len();
            }
            if choice.delta.tool_calls.is_some() {
                has_tool_call = true;
            }
        }
    }

    has_tool_call || (content_chunks >= MIN_CONTENT_CHUNKS && content_chars >= MIN_CONTENT_CHARS)
}

struct Entry {
    chunks: Vec<UnifiedChunk>,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    ttl: Duration,
    size_bytes: u64,
    tags: HashSet<String>,
}

pub(crate) struct StreamingCache {
    entries: Mutex<HashMap<Fingerprint, Entry>>,
    in_flight: Mutex<HashSet<Fingerprint>>,
    max_entries: usize,
    max_size_bytes: u64,
    default_ttl: Duration,
}

impl StreamingCache {
    pub(crate) fn new(max_entries: usize, max_size_bytes: u64, default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            max_entries,
            max_size_bytes,
            default_ttl,
        }
    }

    /// Returns the cached chunk sequence on a hit, bumping LRU metadata.
    pub(crate) fn get(&self, key: &Fingerprint) -> Option<Vec<UnifiedChunk>> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(key)?;

        if entry.created_at.elapsed() > entry.ttl {
            entries.remove(key);
            return None;
        }

        entry.last_accessed = Instant::now();
        entry.access_count += 1;
        Some(entry.chunks.clone())
    }

    /// Claims the writer slot for `key`; returns `false` if another request
    /// is already building this fingerprint.
    pub(crate) fn try_acquire_writer(&self, key: &Fingerprint) -> bool {
        self.in_flight.lock().unwrap().insert(key.clone())
    }

    pub(crate) fn release_writer(&self, key: &Fingerprint) {
        self.in_flight.lock().unwrap().remove(key);
    }

    /// Stores a completed, cacheable chunk sequence, evicting as needed.
    pub(crate) fn insert(&self, key: Fingerprint, chunks: Vec<UnifiedChunk>, tags: HashSet<String>) {
        self.insert_with_ttl(key, chunks, tags, None);
    }

    /// Like [`Self::insert`], but lets the caller override the default TTL
    /// for this one entry (e.g. a per-request `cache_ttl` query parameter).
    pub(crate) fn insert_with_ttl(&self, key: Fingerprint, chunks: Vec<UnifiedChunk>, tags: HashSet<String>, ttl: Option<Duration>) {
        if !is_cacheable(&chunks) {
            return;
        }

        let size_bytes = chunks.iter().map(|c| sonic_rs::to_vec(c).map(|v| v.len()).unwrap_or(0)).sum::<usize>() as u64;

        let mut entries = self.entries.lock().unwrap();

        entries.insert(
            key,
            Entry {
                chunks,
                created_at: Instant::now(),
                last_accessed: Instant::now(),
                access_count: 0,
                ttl: ttl.unwrap_or(self.default_ttl),
                size_bytes,
                tags,
            },
        );

        self.evict_if_needed(&mut entries);
    }

    fn evict_if_needed(&self, entries: &mut HashMap<Fingerprint, Entry>) {
        while entries.len() > self.max_entries || total_size(entries) > self.max_size_bytes {
            let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            entries.remove(&lru_key);
        }
    }

    /// Sweeps all entries whose TTL has elapsed. Intended to run on a
    /// fixed interval from a background task.
    pub(crate) fn sweep_expired(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| entry.created_at.elapsed() <= entry.ttl);
    }

    /// Snapshot of cache occupancy for the introspection endpoint.
    pub(crate) fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().unwrap();
        CacheStats {
            entry_count: entries.len(),
            total_size_bytes: total_size(&entries),
            max_entries: self.max_entries,
            max_size_bytes: self.max_size_bytes,
        }
    }

    /// Removes every entry matching any of the supplied criteria.
    pub(crate) fn invalidate(&self, fingerprint_pattern: Option<&regex::Regex>, tag: Option<&str>, older_than: Option<Duration>) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|key, entry| {
            let matches_pattern = fingerprint_pattern.is_some_and(|re| re.is_match(key));
            let matches_tag = tag.is_some_and(|t| entry.tags.contains(t));
            let matches_age = older_than.is_some_and(|age| entry.created_at.elapsed() >= age);

            !(matches_pattern || matches_tag || matches_age)
        });
    }
}

fn total_size(entries: &HashMap<Fingerprint, Entry>) -> u64 {
    entries.values().map(|e| e.size_bytes).sum()
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheStats {
    pub entry_count: usize,
    pub total_size_bytes: u64,
    pub max_entries: usize,
    pub max_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{UnifiedChoiceDelta, UnifiedMessageDelta};

    fn chunk_with_text(text: &str) -> UnifiedChunk {
        UnifiedChunk {
            id: "chatcmpl-1".into(),
            model: "big".into(),
            created: 0,
            usage: None,
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta: UnifiedMessageDelta {
                    role: None,
                    content: Some(text.to_string()),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
        }
    }

    #[test]
    fn rejects_short_sequences() {
        let chunks = vec![chunk_with_text("hi"); 2];
        assert!(!is_cacheable(&chunks));
    }

    #[test]
    fn accepts_sequences_with_enough_content() {
        let chunks: Vec<_> = (0..6).map(|_| chunk_with_text("hello world, this is a chunk")).collect();
        assert!(is_cacheable(&chunks));
    }

    #[test]
    fn at_most_once_writer_slot() {
        let cache = StreamingCache::new(10, 1024 * 1024, Duration::from_secs(60));
        let key = "fp1".to_string();

        assert!(cache.try_acquire_writer(&key));
        assert!(!cache.try_acquire_writer(&key));

        cache.release_writer(&key);
        assert!(cache.try_acquire_writer(&key));
    }

    #[test]
    fn evicts_least_recently_used_past_capacity() {
        let cache = StreamingCache::new(1, 1024 * 1024, Duration::from_secs(60));
        let chunks: Vec<_> = (0..6).map(|_| chunk_with_text("hello world, this is a chunk")).collect();

        cache.insert("a".to_string(), chunks.clone(), HashSet::new());
        cache.insert("b".to_string(), chunks, HashSet::new());

        assert!(cache.get(&"a".to_string()).is_none());
        assert!(cache.get(&"b".to_string()).is_some());
    }
}
