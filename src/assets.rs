//! The static asset pool.
//!
//! File bodies for registered directory trees are loaded into a fixed-budget
//! arena and served zero-copy: the transport writes straight out of the
//! pool's memory through a reference-counted [`NodeRef`] pin. A watcher
//! thread swaps bodies when files change on disk; replaced bodies are
//! retired, not freed, until every in-flight reference is gone and a grace
//! period has passed.

use crate::{http::response::BodyPin, limits::PoolLimits};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};
use tracing::{debug, info, warn};

/// One registered (url-prefix, filesystem-root) mapping.
#[derive(Debug, Clone)]
pub(crate) struct StaticDir {
    pub(crate) prefix: String,
    pub(crate) root: PathBuf,
}

// Registered prefixes always start with '/' and never end with one,
// except the bare root prefix.
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let mut normalized = match prefix.starts_with('/') {
        true => prefix.to_string(),
        false => format!("/{prefix}"),
    };
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

pub(crate) fn normalize_root(directory: &str) -> PathBuf {
    let trimmed = directory.trim_end_matches('/');
    match trimmed.is_empty() {
        true => PathBuf::from("."),
        false => PathBuf::from(trimmed),
    }
}

/// Where a request path landed inside a registered mapping.
pub(crate) struct StaticTarget<'a> {
    pub(crate) dir: &'a StaticDir,
    pub(crate) relative: Option<&'a str>,
    pub(crate) use_index: bool,
}

/// Matches a request path against one prefix. A match requires the prefix
/// to be followed by end-of-string or `/`, or to be the root prefix `/`.
pub(crate) fn match_prefix<'a>(
    dir: &'a StaticDir,
    req_path: &'a str,
) -> Option<StaticTarget<'a>> {
    let prefix = dir.prefix.as_str();
    if req_path.is_empty() || prefix.is_empty() {
        return None;
    }

    if prefix == "/" {
        if !req_path.starts_with('/') {
            return None;
        }
        return Some(match req_path.len() == 1 {
            true => StaticTarget {
                dir,
                relative: None,
                use_index: true,
            },
            false => StaticTarget {
                dir,
                relative: Some(&req_path[1..]),
                use_index: false,
            },
        });
    }

    let rest = req_path.strip_prefix(prefix)?;
    match rest.as_bytes().first() {
        None => Some(StaticTarget {
            dir,
            relative: None,
            use_index: true,
        }),
        Some(b'/') => Some(StaticTarget {
            dir,
            relative: Some(&rest[1..]),
            use_index: false,
        }),
        Some(_) => None,
    }
}

/// True if any `/`-separated segment is `..`.
pub(crate) fn has_parent_ref(path: &str) -> bool {
    path.split('/').any(|segment| segment == "..")
}

const MIME_TABLE: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("htm", "text/html; charset=utf-8"),
    ("css", "text/css; charset=utf-8"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("txt", "text/plain; charset=utf-8"),
    ("ico", "image/x-icon"),
];

pub(crate) fn mime_for(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return "application/octet-stream";
    };
    MIME_TABLE
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(ext))
        .map(|(_, mime)| *mime)
        .unwrap_or("application/octet-stream")
}

// A loaded file body. Never mutated after creation; replacement allocates a
// fresh node and retires this one.
#[derive(Debug)]
pub(crate) struct PoolNode {
    data: Box<[u8]>,
}

/// A reference-counted claim on a pool node's bytes.
///
/// While any `NodeRef` exists the node's memory stays valid, even after the
/// watcher swapped the entry to a newer body. Dropping the last reference
/// makes a retired node eligible for reclamation once its grace period has
/// also passed.
#[derive(Debug)]
pub(crate) struct NodeRef {
    node: Arc<PoolNode>,
}

impl BodyPin for NodeRef {
    #[inline(always)]
    fn bytes(&self) -> &[u8] {
        &self.node.data
    }
}

struct PoolEntry {
    fs_path: PathBuf,
    node: Arc<PoolNode>,
    size: usize,
    modified: SystemTime,
}

struct RetiredNode {
    node: Arc<PoolNode>,
    expires_at: Instant,
}

struct PoolInner {
    entries: Vec<PoolEntry>,
    current_used: usize,
    capacity: usize,
    retired: Vec<RetiredNode>,
}

impl PoolInner {
    // `current_used - reclaimable + incoming <= capacity`, saturating the
    // reclaimable share at what is actually accounted.
    fn has_capacity(&self, incoming: usize, reclaimable: usize) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if incoming > self.capacity {
            return false;
        }
        let reclaimable = reclaimable.min(self.current_used);
        self.current_used - reclaimable + incoming <= self.capacity
    }

    fn register_file(&mut self, fs_path: &Path) {
        let meta = match fs::metadata(fs_path) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %fs_path.display(), %err, "skipping unreadable static file");
                return;
            }
        };
        let size = meta.len() as usize;

        if !self.has_capacity(size, 0) {
            warn!(
                path = %fs_path.display(),
                size,
                used = self.current_used,
                capacity = self.capacity,
                "skipping static file over pool capacity",
            );
            return;
        }

        let data = match fs::read(fs_path) {
            Ok(data) => data,
            Err(err) => {
                warn!(path = %fs_path.display(), %err, "failed to load static file");
                return;
            }
        };

        self.entries.push(PoolEntry {
            fs_path: fs_path.to_path_buf(),
            node: Arc::new(PoolNode {
                data: data.into_boxed_slice(),
            }),
            size,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
        self.current_used += size;
    }

    // A retired node is freed once its grace deadline passed and no NodeRef
    // remains; the retired list's own Arc is then the only holder.
    fn reap_retired(&mut self, now: Instant) {
        self.retired
            .retain(|r| r.expires_at > now || Arc::strong_count(&r.node) > 1);
    }
}

/// The arena of loaded static files.
pub(crate) struct StaticPool {
    inner: Arc<Mutex<PoolInner>>,
    limits: PoolLimits,
    running: Arc<AtomicBool>,
    watcher: Option<thread::JoinHandle<()>>,
}

impl StaticPool {
    /// Walks every mapping twice: once to size the budget, once to load.
    /// Files that cannot be loaded or do not fit are skipped with a log
    /// line; serving continues without them.
    pub(crate) fn build(dirs: &[StaticDir], limits: &PoolLimits) -> Self {
        let mut total = 0usize;
        for dir in dirs {
            scan_recursive(&dir.root, &mut |_, meta| total += meta.len() as usize);
        }

        // Auto-sizing doubles the scanned total; an empty tree substitutes
        // a 1 MiB total before doubling so the pool never starts at zero.
        let capacity = match limits.capacity {
            0 => match total {
                0 => 2 * 1024 * 1024,
                scanned => scanned * 2,
            },
            configured => configured,
        };

        let mut inner = PoolInner {
            entries: Vec::new(),
            current_used: 0,
            capacity,
            retired: Vec::new(),
        };

        for dir in dirs {
            scan_recursive(&dir.root, &mut |path, _| inner.register_file(path));
        }

        info!(
            used = inner.current_used,
            capacity = inner.capacity,
            files = inner.entries.len(),
            "static pool initialized",
        );

        Self {
            inner: Arc::new(Mutex::new(inner)),
            limits: limits.clone(),
            running: Arc::new(AtomicBool::new(false)),
            watcher: None,
        }
    }

    /// Acquires a reference to the body loaded for `fs_path`.
    pub(crate) fn lookup(&self, fs_path: &Path) -> Option<(NodeRef, usize)> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .iter()
            .find(|e| e.fs_path == fs_path)
            .map(|e| {
                (
                    NodeRef {
                        node: e.node.clone(),
                    },
                    e.size,
                )
            })
    }

    /// One watcher pass: refresh entries whose files changed on disk, then
    /// reclaim quiescent retired nodes.
    pub(crate) fn scan_for_changes(&self) {
        let snapshot: Vec<(usize, PathBuf, SystemTime)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .entries
                .iter()
                .enumerate()
                .map(|(i, e)| (i, e.fs_path.clone(), e.modified))
                .collect()
        };

        for (index, fs_path, stored_modified) in snapshot {
            let Ok(meta) = fs::metadata(&fs_path) else {
                // Entries for files that disappear from disk are kept.
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified <= stored_modified {
                continue;
            }

            // The file read happens outside the pool lock.
            let data = match fs::read(&fs_path) {
                Ok(data) => data,
                Err(err) => {
                    warn!(path = %fs_path.display(), %err, "failed to reload static file");
                    continue;
                }
            };
            let incoming = data.len();

            let mut inner = self.inner.lock().unwrap();
            let reclaimable = inner.entries[index].size;
            if !inner.has_capacity(incoming, reclaimable) {
                warn!(
                    path = %fs_path.display(),
                    incoming,
                    used = inner.current_used,
                    capacity = inner.capacity,
                    "refresh refused, pool capacity would be exceeded",
                );
                continue;
            }

            let expires_at = Instant::now() + self.limits.retire_grace;
            let entry = &mut inner.entries[index];
            let old_node = std::mem::replace(
                &mut entry.node,
                Arc::new(PoolNode {
                    data: data.into_boxed_slice(),
                }),
            );
            let old_size = entry.size;
            entry.size = incoming;
            entry.modified = modified;

            inner.current_used = inner.current_used - old_size.min(inner.current_used) + incoming;
            inner.retired.push(RetiredNode {
                node: old_node,
                expires_at,
            });

            debug!(path = %fs_path.display(), size = incoming, "hot reload swapped static body");
        }

        let mut inner = self.inner.lock().unwrap();
        inner.reap_retired(Instant::now());
    }

    pub(crate) fn start_watcher(&mut self) {
        if self.watcher.is_some() {
            return;
        }
        self.running.store(true, Ordering::Release);

        let inner = self.inner.clone();
        let limits = self.limits.clone();
        let running = self.running.clone();

        let pool = StaticPool {
            inner,
            limits: limits.clone(),
            running: running.clone(),
            watcher: None,
        };

        let handle = thread::Builder::new()
            .name("hearth-static-watcher".to_string())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    // Sleep in short slices so shutdown is prompt.
                    let deadline = Instant::now() + limits.watch_interval;
                    while Instant::now() < deadline {
                        if !running.load(Ordering::Acquire) {
                            return;
                        }
                        thread::sleep(Duration::from_millis(50).min(limits.watch_interval));
                    }
                    pool.scan_for_changes();
                }
            })
            .expect("failed to spawn static pool watcher");

        self.watcher = Some(handle);
    }

    #[cfg(test)]
    pub(crate) fn current_used(&self) -> usize {
        self.inner.lock().unwrap().current_used
    }

    #[cfg(test)]
    pub(crate) fn accounted_sizes(&self) -> usize {
        self.inner.lock().unwrap().entries.iter().map(|e| e.size).sum()
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    #[cfg(test)]
    pub(crate) fn retired_len(&self) -> usize {
        self.inner.lock().unwrap().retired.len()
    }
}

impl Drop for StaticPool {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.watcher.take() {
            let _ = handle.join();
        }
    }
}

// Depth-first walk over regular files, in name order so load results are
// deterministic.
fn scan_recursive(root: &Path, visit: &mut dyn FnMut(&Path, &fs::Metadata)) {
    let Ok(read) = fs::read_dir(root) else {
        return;
    };

    let mut paths: Vec<PathBuf> = read.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        if meta.is_dir() {
            scan_recursive(&path, visit);
        } else if meta.is_file() {
            visit(&path, &meta);
        }
    }
}
