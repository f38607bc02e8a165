use jnlp_cache::{CacheConfig, LruCacheIndexHolder, ResourceCache, VersionId};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tracing_subscriber::fmt::MakeWriter;
use url::Url;

#[derive(Clone, Default)]
struct SharedLogBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedLogBuffer {
    fn as_string(&self) -> String {
        let bytes = self.0.lock().expect("log buffer mutex poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedLogWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self.0.lock().expect("log buffer mutex poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SharedLogBuffer {
    type Writer = SharedLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedLogWriter(self.0.clone())
    }
}

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

#[test]
fn index_survives_store_and_reload() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("recently_used");
    let writer = LruCacheIndexHolder::new(&path);

    let v = VersionId::parse("1.2-beta").unwrap();
    writer
        .run_synchronized(|index| {
            index.create_entry("0", &url("http://x/a.jar"), Some(&v));
            index.create_entry("1", &url("https://y:8443/b%20c.jar?q=1"), None);
            index.create_entry("2", &url("http://x/c.jar"), None);
            index.mark_entry_for_deletion("2");
        })
        .unwrap();
    let written = writer
        .get_synchronized(|index| Ok(index.entries().to_vec()))
        .unwrap();

    // A fresh holder sees the same entries in the same order.
    let reader = LruCacheIndexHolder::new(&path);
    let reloaded = reader
        .get_synchronized(|index| {
            assert!(!index.is_dirty());
            Ok(index.entries().to_vec())
        })
        .unwrap();
    assert_eq!(reloaded, written);

    let ids: Vec<_> = reloaded.iter().map(|e| e.id().to_owned()).collect();
    assert_eq!(ids, vec!["1", "0", "2"]);
    assert_eq!(reloaded[1].version(), Some(&v));
    assert!(reloaded[2].is_marked_for_deletion());
}

#[test]
fn corrupt_index_is_healed_with_a_warning() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("recently_used");
    std::fs::write(
        &path,
        "garbage line\n\
         0.href=http\\://x/a.jar\n\
         0.lastAccessed=10\n\
         1.href=http\\://x/b.jar\n\
         1.lastAccessed=yesterday\n\
         2.lastAccessed=12\n\
         3.href=http\\://x/d.jar\n\
         3.lastAccessed=11\n\
         3.color=blue\n",
    )
    .unwrap();

    let logs = SharedLogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();

    let holder = LruCacheIndexHolder::new(&path);
    let ids = tracing::subscriber::with_default(subscriber, || {
        holder
            .get_synchronized(|index| {
                Ok(index
                    .entries()
                    .iter()
                    .map(|e| e.id().to_owned())
                    .collect::<Vec<_>>())
            })
            .unwrap()
    });
    assert_eq!(ids, vec!["3", "0"]);

    let output = logs.as_string();
    assert!(output.contains("WARN"), "{output}");
    assert!(output.contains("clear the cache"), "{output}");

    // The healed index was written back even though the action changed nothing.
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(!text.contains("garbage"), "{text}");
    assert!(!text.contains("1.href"), "{text}");
    assert!(!text.contains("2.lastAccessed"), "{text}");
    assert!(!text.contains("3.color"), "{text}");
    assert!(text.contains("0.lastAccessed=10"), "{text}");

    let logs = SharedLogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        holder.run_synchronized(|_| {}).unwrap();
    });
    assert_eq!(logs.as_string(), "");
}

#[test]
fn access_order_survives_reload_within_one_millisecond() {
    let tmp = tempfile::tempdir().unwrap();
    let holder = LruCacheIndexHolder::new(tmp.path().join("recently_used"));
    let urls: Vec<_> = (0..20).map(|i| url(&format!("http://x/{i}.jar"))).collect();

    for (i, u) in urls.iter().enumerate() {
        holder
            .run_synchronized(|index| {
                index.create_entry(i.to_string(), u, None);
            })
            .unwrap();
    }
    holder
        .run_synchronized(|index| {
            index.find_and_mark_as_accessed(&urls[3], None);
        })
        .unwrap();

    let ids = holder
        .get_synchronized(|index| {
            Ok(index
                .entries()
                .iter()
                .map(|e| e.id().to_owned())
                .collect::<Vec<_>>())
        })
        .unwrap();
    let mut expected: Vec<String> = (0..20).rev().map(|i: usize| i.to_string()).collect();
    expected.retain(|id| id != "3");
    expected.insert(0, "3".to_owned());
    assert_eq!(ids, expected);
}

#[test]
fn concurrent_allocations_get_distinct_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let cache_root = tmp.path().join("cache");

    let threads = 16;
    let mut handles = Vec::with_capacity(threads);
    for i in 0..threads {
        // Separate handles on one root behave like separate launcher processes.
        let cache = ResourceCache::new(CacheConfig::new(&cache_root)).unwrap();
        handles.push(thread::spawn(move || {
            let location = url(&format!("http://host{i}/lib/a.jar"));
            let path = cache.get_cache_file(&location, None).unwrap();
            assert_eq!(cache.get_cache_file(&location, None).unwrap(), path);
            cache.layout().numbered_dir(&path).unwrap()
        }));
    }

    let mut dirs = BTreeSet::new();
    for handle in handles {
        assert!(dirs.insert(handle.join().unwrap()));
    }
    assert_eq!(dirs.len(), threads);

    let cache = ResourceCache::new(CacheConfig::new(&cache_root)).unwrap();
    let ids: BTreeSet<String> = cache
        .index()
        .get_synchronized(|index| Ok(index.entries().iter().map(|e| e.id().to_owned()).collect()))
        .unwrap();
    let expected: BTreeSet<String> = (0..threads).map(|i| i.to_string()).collect();
    assert_eq!(ids, expected);
}

#[test]
fn shared_cache_handle_across_threads() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = Arc::new(ResourceCache::new(CacheConfig::new(tmp.path().join("cache"))).unwrap());
    let location = url("http://x/shared.jar");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let location = location.clone();
            thread::spawn(move || cache.get_cache_file(&location, None).unwrap())
        })
        .collect();
    let paths: BTreeSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(paths.len(), 1);
}

#[test]
fn cache_operations_wait_for_a_running_index_action() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = ResourceCache::new(CacheConfig::new(tmp.path().join("cache"))).unwrap();
    let location = url("http://x/a.jar");
    let action_done = Arc::new(AtomicBool::new(false));
    let (locked_tx, locked_rx) = mpsc::channel();

    let holder = cache.index().clone();
    let done = action_done.clone();
    let writer = thread::spawn(move || {
        holder
            .run_synchronized(|index| {
                locked_tx.send(()).unwrap();
                thread::sleep(std::time::Duration::from_millis(50));
                assert!(index.entries().is_empty());
                done.store(true, Ordering::SeqCst);
            })
            .unwrap();
    });

    locked_rx.recv().unwrap();
    // Blocks until the action above releases the index lock.
    cache.get_cache_file(&location, None).unwrap();
    assert!(action_done.load(Ordering::SeqCst));
    writer.join().unwrap();
}
