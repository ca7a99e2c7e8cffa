//! File strategy over in-memory storage and a virtual clock.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use tether_core::{lens, Shared};
use tether_effects::FileKey;
use tether_testkit::{init_test_tracing, TestDependencies};

const PATH: &str = "/app/document.json";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Document {
    title: String,
    tags: Vec<String>,
}

fn titled(title: &str) -> Document {
    Document {
        title: title.to_string(),
        tags: Vec::new(),
    }
}

fn stored(env: &TestDependencies) -> Option<Document> {
    env.files
        .contents(PATH)
        .filter(|bytes| !bytes.is_empty())
        .map(|bytes| serde_json::from_slice(&bytes).unwrap())
}

fn env_with_debounce(seconds: u64) -> TestDependencies {
    init_test_tracing();
    TestDependencies::new().with_file_debounce(Duration::from_secs(seconds))
}

#[test]
fn burst_of_writes_costs_one_write() {
    let env = env_with_debounce(5);
    let _scope = env.enter();
    let document = Shared::persisted(FileKey::new(PATH), Document::default());
    // Subscribing created the (empty) file.
    let baseline = env.files.write_count(PATH);

    document.write(titled("A"));
    env.advance(Duration::from_secs(1));
    document.write(titled("B"));

    // The window opened by the first write is not extended.
    env.advance(Duration::from_millis(3_900));
    assert_eq!(env.files.write_count(PATH), baseline);
    assert_eq!(stored(&env), None);

    env.advance(Duration::from_millis(100));
    assert_eq!(env.scheduler().now(), Duration::from_secs(5));
    assert_eq!(env.files.write_count(PATH), baseline + 1);
    assert_eq!(stored(&env), Some(titled("B")));

    env.advance(Duration::from_secs(60));
    assert_eq!(env.files.write_count(PATH), baseline + 1);
}

#[test]
fn steady_writes_still_persist_every_window() {
    let env = env_with_debounce(5);
    let _scope = env.enter();
    let document = Shared::persisted(FileKey::new(PATH), Document::default());
    let baseline = env.files.write_count(PATH);

    for second in 0..10 {
        document.write(titled(&format!("v{second}")));
        env.advance(Duration::from_secs(1));
    }
    assert_eq!(env.files.write_count(PATH), baseline + 2);
    assert_eq!(stored(&env), Some(titled("v9")));
}

#[test]
fn suspend_flushes_pending_write() {
    let env = env_with_debounce(30);
    let _scope = env.enter();
    let document = Shared::persisted(FileKey::new(PATH), Document::default());
    let baseline = env.files.write_count(PATH);

    document.write(titled("draft"));
    env.files.simulate_suspend();
    assert_eq!(env.files.write_count(PATH), baseline + 1);
    assert_eq!(stored(&env), Some(titled("draft")));

    // The flushed write does not fire again when the timer comes due.
    env.advance(Duration::from_secs(30));
    assert_eq!(env.files.write_count(PATH), baseline + 1);
}

#[test]
fn explicit_save_bypasses_debounce() {
    let env = env_with_debounce(30);
    let _scope = env.enter();
    let document = Shared::persisted(FileKey::new(PATH), Document::default());
    let baseline = env.files.write_count(PATH);

    document.write(titled("now"));
    document.save().unwrap();
    assert_eq!(stored(&env), Some(titled("now")));
    assert_eq!(env.scheduler().pending_count(), 0);

    env.advance(Duration::from_secs(30));
    assert_eq!(env.files.write_count(PATH), baseline + 1);
}

#[test]
fn dropping_last_cell_flushes() {
    let env = env_with_debounce(30);
    let _scope = env.enter();
    Shared::persisted(FileKey::new(PATH), Document::default()).write(titled("bye"));
    assert_eq!(stored(&env), Some(titled("bye")));
}

#[test]
fn own_writes_are_not_echoed_as_external_changes() {
    let env = env_with_debounce(1);
    let _scope = env.enter();
    let document = Shared::persisted(FileKey::new(PATH), Document::default());
    let notifications = Arc::new(Mutex::new(Vec::new()));
    let sink = notifications.clone();
    let _observation = document.subscribe(move |value| sink.lock().push(value.clone()));

    document.write(titled("mine"));
    let before_flush = document.read();
    env.advance(Duration::from_secs(1));

    assert_eq!(document.read(), before_flush);
    assert_eq!(*notifications.lock(), vec![titled("mine")]);
}

#[test]
fn external_restore_of_own_contents_is_applied() {
    let env = env_with_debounce(1);
    let _scope = env.enter();
    let document = Shared::persisted(FileKey::new(PATH), Document::default());
    document.write(titled("A"));
    env.advance(Duration::from_secs(1));
    let ours = env.files.contents(PATH).unwrap();

    env.files
        .write_externally(PATH, serde_json::to_vec(&titled("B")).unwrap());
    assert_eq!(document.read(), titled("B"));

    env.files.write_externally(PATH, ours);
    assert_eq!(document.read(), titled("A"));
}

#[test]
fn external_change_updates_every_holder() {
    let env = env_with_debounce(1);
    let _scope = env.enter();
    let first = Shared::persisted(FileKey::new(PATH), Document::default());
    let second = Shared::persisted(FileKey::new(PATH), titled("ignored default"));
    assert!(first.same_reference(&second));
    let title = first.project(lens!(Document, title));

    let external = Document {
        title: "from disk".into(),
        tags: vec!["synced".into()],
    };
    env.files
        .write_externally(PATH, serde_json::to_vec(&external).unwrap());

    assert_eq!(first.read(), external);
    assert_eq!(second.read(), external);
    assert_eq!(title.read(), "from disk");
}

#[test]
fn external_change_does_not_need_assertion() {
    let env = env_with_debounce(1);
    env.run(|| {
        let document = Shared::persisted(FileKey::new(PATH), Document::default());
        env.files
            .write_externally(PATH, serde_json::to_vec(&titled("outside")).unwrap());
        assert_eq!(document.read(), titled("outside"));
    });
}

#[test]
fn external_change_rebases_tracked_snapshot() {
    let env = env_with_debounce(1);
    env.run(|| {
        let document = Shared::persisted(FileKey::new(PATH), Document::default());
        document.write(titled("local"));
        env.files
            .write_externally(PATH, serde_json::to_vec(&titled("outside")).unwrap());
        assert_eq!(document.read(), titled("outside"));
        document.write(titled("local again"));
        document.assert(|document| document.title = "local again".into());
    });
}

#[test]
fn deleted_or_emptied_file_resets_to_default() {
    let env = env_with_debounce(1);
    let _scope = env.enter();
    let default = titled("default");
    let document = Shared::persisted(FileKey::new(PATH), default.clone());

    env.files
        .write_externally(PATH, serde_json::to_vec(&titled("outside")).unwrap());
    assert_eq!(document.read(), titled("outside"));

    env.files.remove_externally(PATH);
    assert_eq!(document.read(), default);

    env.files
        .write_externally(PATH, serde_json::to_vec(&titled("back")).unwrap());
    env.files.write_externally(PATH, Vec::new());
    assert_eq!(document.read(), default);
}

#[test]
fn corrupt_external_change_is_ignored() {
    let env = env_with_debounce(1);
    let _scope = env.enter();
    let document = Shared::persisted(FileKey::new(PATH), titled("default"));
    env.files.write_externally(PATH, b"{ not json".to_vec());
    assert_eq!(document.read(), titled("default"));
}

#[test]
fn existing_file_is_loaded_and_corrupt_file_falls_back() {
    let env = env_with_debounce(1);
    let _scope = env.enter();
    env.files
        .write_externally(PATH, serde_json::to_vec(&titled("persisted")).unwrap());
    assert_eq!(
        Shared::persisted(FileKey::new(PATH), Document::default()).read(),
        titled("persisted")
    );

    let corrupt = Path::new("/app/corrupt.json");
    env.files.write_externally(corrupt, b"[1, 2".to_vec());
    assert_eq!(
        Shared::persisted(FileKey::new(corrupt), titled("fallback")).read(),
        titled("fallback")
    );
}

#[test]
fn round_trip_through_reload() {
    let env = env_with_debounce(1);
    let _scope = env.enter();
    let document = Shared::persisted(FileKey::new(PATH), Document::default());
    let value = Document {
        title: "round trip".into(),
        tags: vec!["a".into(), "b".into()],
    };
    document.write(value.clone());
    env.advance(Duration::from_secs(1));
    document.load();
    assert_eq!(document.read(), value);
}

#[test]
fn require_fails_without_stored_document() {
    let env = env_with_debounce(1);
    let _scope = env.enter();
    assert!(Shared::<Document>::require(FileKey::new("/app/absent.json")).is_err());
}

#[test]
fn watch_ends_with_last_holder() {
    let env = env_with_debounce(1);
    let _scope = env.enter();
    let document = Shared::persisted(FileKey::new(PATH), Document::default());
    assert_eq!(env.files.watcher_count(PATH), 1);
    drop(document);
    assert_eq!(env.files.watcher_count(PATH), 0);
}
