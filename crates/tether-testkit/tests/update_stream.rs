//! Values flowing out of shared cells and strategies as streams.

use futures::executor::block_on;
use futures::StreamExt;
use tether_core::{lens, PersistenceKey, Shared, SubscriberUpdate};
use tether_effects::{FileKey, SettingsKey, SettingsValue};
use tether_testkit::TestDependencies;

#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
struct Player {
    name: String,
    score: u32,
}

#[test]
fn cell_updates_yield_distinct_values() {
    let env = TestDependencies::new();
    let _scope = env.enter();
    let player = Shared::persisted(FileKey::new("/player.json"), Player::default());
    let score = player.project(lens!(Player, score));
    let mut updates = score.updates();

    score.write(1);
    player.project(lens!(Player, name)).write("ann".into());
    score.write(1);
    score.write(5);

    assert_eq!(block_on(updates.next()), Some(1));
    assert_eq!(block_on(updates.next()), Some(5));
    assert_eq!(updates.try_next_now(), None);
}

#[test]
fn external_file_changes_reach_cell_stream() {
    let env = TestDependencies::new();
    let _scope = env.enter();
    let player = Shared::persisted(FileKey::new("/player.json"), Player::default());
    let mut updates = player.reader().updates();

    let external = Player {
        name: "bo".into(),
        score: 9,
    };
    env.files
        .write_externally("/player.json", serde_json::to_vec(&external).unwrap());
    assert_eq!(block_on(updates.next()), Some(external));
}

#[test]
fn strategy_updates_bridge_store_notifications() {
    let env = TestDependencies::new();
    let _scope = env.enter();
    let key = SettingsKey::<i64>::new("level");
    let mut updates = key.updates(Some(0));

    env.settings.set("level", SettingsValue::Integer(2)).unwrap();
    env.settings.remove("level").unwrap();

    assert_eq!(block_on(updates.next()), Some(SubscriberUpdate::Value(2)));
    assert_eq!(block_on(updates.next()), Some(SubscriberUpdate::Reset));
}

#[test]
fn dropping_stream_ends_subscription() {
    let env = TestDependencies::new();
    let _scope = env.enter();
    let key = FileKey::<Player>::new("/watched.json");
    let updates = key.updates(None);
    assert_eq!(env.files.watcher_count("/watched.json"), 1);
    drop(updates);
    assert_eq!(env.files.watcher_count("/watched.json"), 0);
}
