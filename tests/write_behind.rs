/// integration tests for the striped write-behind engine against a recording writer
///
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;

use kv_cache_lib::config::{BatchingConfig, WriteBehindConfig};
use kv_cache_lib::service::{lookup, ServiceFactories, ServiceLocator, ServiceType};
use kv_cache_lib::store::CacheLoaderWriter;
use kv_cache_lib::write_behind::{StripedWriteBehind, WriteBehind, WriteBehindProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Write(String, u32),
    WriteAll(Vec<(String, u32)>),
    Delete(String),
    DeleteAll(Vec<String>),
}

#[derive(Default)]
struct RecordingWriter {
    calls: Mutex<Vec<Call>>,
    stored: Mutex<HashMap<String, u32>>,
    delay: Option<Duration>,
}

impl RecordingWriter {
    fn slow(delay: Duration) -> RecordingWriter {
        RecordingWriter {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn pause(&self) {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
    }
}

impl CacheLoaderWriter<String, u32> for RecordingWriter {
    fn load(&self, key: &String) -> anyhow::Result<Option<u32>> {
        Ok(self.stored.lock().get(key).copied())
    }

    fn write(&self, key: &String, value: &u32) -> anyhow::Result<()> {
        self.pause();
        self.calls.lock().push(Call::Write(key.clone(), *value));
        if key == "poison" {
            anyhow::bail!("store rejected {}", key);
        }
        self.stored.lock().insert(key.clone(), *value);
        Ok(())
    }

    fn write_all(&self, entries: &[(String, u32)]) -> anyhow::Result<()> {
        self.pause();
        self.calls.lock().push(Call::WriteAll(entries.to_vec()));
        if entries.iter().any(|(key, _)| key == "poison") {
            anyhow::bail!("store rejected batch");
        }
        let mut stored = self.stored.lock();
        for (key, value) in entries {
            stored.insert(key.clone(), *value);
        }
        Ok(())
    }

    fn delete(&self, key: &String) -> anyhow::Result<()> {
        self.pause();
        self.calls.lock().push(Call::Delete(key.clone()));
        self.stored.lock().remove(key);
        Ok(())
    }

    fn delete_all(&self, keys: &[String]) -> anyhow::Result<()> {
        self.pause();
        self.calls.lock().push(Call::DeleteAll(keys.to_vec()));
        let mut stored = self.stored.lock();
        for key in keys {
            stored.remove(key);
        }
        Ok(())
    }
}

struct Fixture {
    locator: ServiceLocator,
    writer: Arc<RecordingWriter>,
    engine: Arc<StripedWriteBehind<String, u32>>,
}

impl Fixture {
    fn new(writer: RecordingWriter, config: WriteBehindConfig) -> Fixture {
        let locator = ServiceLocator::dependency_set(ServiceFactories::with_defaults())
            .with_type(ServiceType::of::<WriteBehindProvider>())
            .build()
            .expect("should resolve the write-behind provider");
        locator.start_all_services().expect("should start services");

        let writer = Arc::new(writer);
        let provider = lookup::<WriteBehindProvider>(&locator).expect("should find the provider");
        let engine = provider
            .create_write_behind(writer.clone(), &config)
            .expect("should create the engine");
        engine.start().expect("should start the engine");

        Fixture {
            locator,
            writer,
            engine,
        }
    }

    fn write(&self, key: &str, value: u32) {
        self.engine.write(&key.to_string(), &value).unwrap();
    }

    fn delete(&self, key: &str) {
        self.engine.delete(&key.to_string()).unwrap();
    }

    fn shutdown(self) -> Arc<RecordingWriter> {
        self.engine.stop().unwrap();
        self.locator.stop_all_services().unwrap();
        self.writer
    }
}

fn batching(batch_size: usize, max_delay: Duration, coalescing: bool) -> WriteBehindConfig {
    WriteBehindConfig::default().with_batching(BatchingConfig::new(batch_size, max_delay, coalescing))
}

fn wait_until<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

fn entries(list: &[(&str, u32)]) -> Vec<(String, u32)> {
    list.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[test]
fn full_batch_then_expired_batch() {
    let fixture = Fixture::new(
        RecordingWriter::default(),
        batching(3, Duration::from_millis(100), false),
    );

    for (n, key) in ["a", "b", "c", "d"].iter().enumerate() {
        fixture.write(key, n as u32);
    }

    let writer = fixture.writer.clone();
    assert!(wait_until(Duration::from_secs(5), || writer.calls().len() == 2));
    assert_eq!(
        writer.calls(),
        vec![
            Call::WriteAll(entries(&[("a", 0), ("b", 1), ("c", 2)])),
            Call::WriteAll(entries(&[("d", 3)])),
        ]
    );

    fixture.shutdown();
}

#[test]
fn open_batch_is_flushed_on_stop() {
    let fixture = Fixture::new(
        RecordingWriter::default(),
        batching(3, Duration::from_secs(60), false),
    );

    for (n, key) in ["a", "b", "c", "d"].iter().enumerate() {
        fixture.write(key, n as u32);
    }

    let writer = fixture.shutdown();
    assert_eq!(
        writer.calls(),
        vec![
            Call::WriteAll(entries(&[("a", 0), ("b", 1), ("c", 2)])),
            Call::WriteAll(entries(&[("d", 3)])),
        ]
    );
}

#[test]
fn coalescing_keeps_the_last_value() {
    let fixture = Fixture::new(
        RecordingWriter::default(),
        batching(10, Duration::from_secs(60), true),
    );

    fixture.write("k", 1);
    fixture.write("k", 2);
    assert_eq!(fixture.engine.queue_size(), 1);

    let writer = fixture.shutdown();
    assert_eq!(writer.calls(), vec![Call::WriteAll(entries(&[("k", 2)]))]);
}

#[test]
fn interleaved_kinds_become_separate_bulk_calls() {
    let fixture = Fixture::new(
        RecordingWriter::default(),
        batching(3, Duration::from_secs(60), false),
    );

    fixture.write("k1", 1);
    fixture.delete("k2");
    fixture.write("k3", 3);

    let writer = fixture.writer.clone();
    assert!(wait_until(Duration::from_secs(5), || writer.calls().len() == 3));
    assert_eq!(
        writer.calls(),
        vec![
            Call::WriteAll(entries(&[("k1", 1)])),
            Call::DeleteAll(vec!["k2".to_string()]),
            Call::WriteAll(entries(&[("k3", 3)])),
        ]
    );

    fixture.shutdown();
}

#[test]
fn same_stripe_keys_keep_submission_order() {
    let fixture = Fixture::new(
        RecordingWriter::default(),
        WriteBehindConfig::default().with_concurrency(4),
    );

    // collect a few keys that share a stripe
    let target = fixture.engine.stripe_index(&"key-0".to_string());
    let keys: Vec<String> = (0..200)
        .map(|n| format!("key-{}", n))
        .filter(|key| fixture.engine.stripe_index(key) == target)
        .take(3)
        .collect();
    assert_eq!(keys.len(), 3);

    let mut expected = vec![];
    for n in 0..30u32 {
        let key = &keys[n as usize % keys.len()];
        fixture.write(key, n);
        expected.push(Call::Write(key.clone(), n));
        // noise on the other stripes
        fixture.write(&format!("other-{}", n), n);
    }

    let writer = fixture.shutdown();
    let observed: Vec<Call> = writer
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::Write(key, _) if keys.contains(key)))
        .collect();
    assert_eq!(observed, expected);
}

#[test]
fn reads_see_pending_operations() {
    let fixture = Fixture::new(
        RecordingWriter::slow(Duration::from_millis(100)),
        WriteBehindConfig::default(),
    );
    fixture
        .writer
        .stored
        .lock()
        .insert("k".to_string(), 7);

    let key = "k".to_string();
    assert_eq!(fixture.engine.load(&key).unwrap(), Some(7));

    fixture.write("k", 8);
    assert_eq!(fixture.engine.load(&key).unwrap(), Some(8));

    fixture.delete("k");
    assert_eq!(fixture.engine.load(&key).unwrap(), None);

    let loaded = fixture
        .engine
        .load_all(&[key.clone(), "missing".to_string()])
        .unwrap();
    assert_eq!(loaded.get(&key), Some(&None));
    assert_eq!(loaded.get("missing"), Some(&None));

    let engine = fixture.engine.clone();
    let writer = fixture.shutdown();
    assert_eq!(
        writer.calls(),
        vec![Call::Write(key.clone(), 8), Call::Delete(key.clone())]
    );
    // drained; reads fall through to the writer's store
    assert_eq!(engine.load(&key).unwrap(), None);
}

#[test]
fn queue_size_counts_pending_operations() {
    let fixture = Fixture::new(
        RecordingWriter::default(),
        batching(5, Duration::from_secs(60), false).with_concurrency(2),
    );
    assert_eq!(fixture.engine.queue_size(), 0);

    fixture
        .engine
        .write_all(&entries(&[("a", 1), ("b", 2), ("c", 3)]))
        .unwrap();
    assert_eq!(fixture.engine.queue_size(), 3);

    let engine = fixture.engine.clone();
    let writer = fixture.shutdown();
    assert_eq!(engine.queue_size(), 0);

    let written: usize = writer
        .calls()
        .iter()
        .map(|call| match call {
            Call::WriteAll(entries) => entries.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(written, 3);
}

#[test]
fn writer_failures_are_swallowed() {
    let fixture = Fixture::new(RecordingWriter::default(), WriteBehindConfig::default());

    fixture.write("poison", 1);
    fixture.write("fine", 2);

    let engine = fixture.engine.clone();
    let writer = fixture.shutdown();
    assert_eq!(
        writer.calls(),
        vec![Call::Write("poison".to_string(), 1), Call::Write("fine".to_string(), 2)]
    );
    assert_eq!(engine.load(&"poison".to_string()).unwrap(), None);
    assert_eq!(engine.load(&"fine".to_string()).unwrap(), Some(2));
}

#[test]
fn failed_bulk_call_does_not_block_the_rest_of_the_batch() {
    let fixture = Fixture::new(
        RecordingWriter::default(),
        batching(4, Duration::from_secs(60), false),
    );

    fixture.write("poison", 1);
    fixture.delete("x");
    fixture.write("y", 2);

    let writer = fixture.shutdown();
    assert_eq!(
        writer.calls(),
        vec![
            Call::WriteAll(entries(&[("poison", 1)])),
            Call::DeleteAll(vec!["x".to_string()]),
            Call::WriteAll(entries(&[("y", 2)])),
        ]
    );
}

#[test]
fn operations_after_stop_are_dropped() {
    let fixture = Fixture::new(RecordingWriter::default(), WriteBehindConfig::default());
    fixture.engine.stop().unwrap();

    fixture.write("late", 1);
    assert_eq!(fixture.engine.queue_size(), 0);

    // a stopped engine can be started again
    fixture.engine.start().unwrap();
    fixture.write("again", 2);

    let writer = fixture.shutdown();
    assert_eq!(writer.calls(), vec![Call::Write("again".to_string(), 2)]);
}
