mod common;

use common::{snapshot, worker_with_observer};
use tracklog_core::{Entry, FieldMask, MAX_UNDO_DEPTH};

#[test]
fn undo_reverses_an_insert() {
    let (mut worker, observer) = worker_with_observer();
    worker.insert(Entry::new(100, "work", "task"));
    assert_eq!(worker.size(), 1);
    assert_eq!(worker.undo_count(), 1);

    worker.undo();

    assert_eq!(worker.size(), 0);
    assert_eq!(worker.undo_count(), 0);
    assert!(worker.categories().is_empty());
    assert!(snapshot(&worker, &observer).is_empty());
}

#[test]
fn undo_reverses_a_removal() {
    let (mut worker, observer) = worker_with_observer();
    let entry = Entry::new(100, "work", "task");
    worker.insert(entry.clone());
    worker.remove(&entry);
    assert_eq!(worker.size(), 0);

    worker.undo();

    assert_eq!(worker.size(), 1);
    let entries = snapshot(&worker, &observer);
    assert_eq!(entries[0].uuid, entry.uuid);
    assert_eq!(entries[0].start, 100);
    assert_eq!(entries[0].category, "work");
    assert!(worker.categories().contains("work"));
}

#[test]
fn undo_reverses_an_edit() {
    let (mut worker, observer) = worker_with_observer();
    let entry = Entry::new(100, "work", "first");
    worker.insert(entry.clone());

    let mut edited = entry.clone();
    edited.category = "play".to_string();
    edited.comment = "second".to_string();
    worker.edit(edited, FieldMask::CATEGORY | FieldMask::COMMENT);

    let entries = snapshot(&worker, &observer);
    assert_eq!(entries[0].category, "play");

    worker.undo();

    let entries = snapshot(&worker, &observer);
    assert_eq!(entries[0].category, "work");
    assert_eq!(entries[0].comment, "first");
    assert!(worker.categories().contains("work"));
    assert!(!worker.categories().contains("play"));
}

#[test]
fn undo_reverses_a_start_time_edit_and_rechains_durations() {
    let (mut worker, observer) = worker_with_observer();
    let a = Entry::new(100, "a", "");
    let b = Entry::new(200, "b", "");
    let c = Entry::new(400, "c", "");
    worker.insert(a);
    worker.insert(b.clone());
    worker.insert(c);

    let mut moved = b.clone();
    moved.start = 300;
    worker.edit(moved, FieldMask::START_TIME);

    let durations: Vec<i64> = snapshot(&worker, &observer)
        .iter()
        .map(|entry| entry.duration)
        .collect();
    assert_eq!(durations, vec![200, 100, -1]);

    worker.undo();

    let entries = snapshot(&worker, &observer);
    let starts: Vec<i64> = entries.iter().map(|entry| entry.start).collect();
    let durations: Vec<i64> = entries.iter().map(|entry| entry.duration).collect();
    assert_eq!(starts, vec![100, 200, 400]);
    assert_eq!(durations, vec![100, 200, -1]);
}

#[test]
fn undo_reverses_a_category_rename() {
    let (mut worker, observer) = worker_with_observer();
    worker.insert(Entry::new(100, "work", ""));
    worker.insert(Entry::new(200, "work", ""));
    worker.insert(Entry::new(300, "home", ""));

    worker.edit_category("work", "play");
    assert!(worker.categories().contains("play"));
    assert!(!worker.categories().contains("work"));

    worker.undo();

    let entries = snapshot(&worker, &observer);
    let categories: Vec<&str> = entries.iter().map(|entry| entry.category.as_str()).collect();
    assert_eq!(categories, vec!["work", "work", "home"]);
    assert!(worker.categories().contains("work"));
    assert!(!worker.categories().contains("play"));
}

#[test]
fn journal_caps_at_ten_and_keeps_the_earliest_mutations() {
    let (mut worker, observer) = worker_with_observer();
    for i in 1..=12 {
        worker.insert(Entry::new(i * 100, "work", ""));
    }
    assert_eq!(worker.undo_count(), MAX_UNDO_DEPTH);

    for _ in 0..MAX_UNDO_DEPTH {
        worker.undo();
    }

    // The two earliest inserts fell off the journal and are permanent.
    assert_eq!(worker.undo_count(), 0);
    assert_eq!(worker.size(), 2);
    let starts: Vec<i64> = snapshot(&worker, &observer)
        .iter()
        .map(|entry| entry.start)
        .collect();
    assert_eq!(starts, vec![100, 200]);
}

#[test]
fn undo_on_an_empty_journal_is_a_no_op() {
    let (mut worker, observer) = worker_with_observer();
    worker.insert(Entry::new(100, "work", ""));
    worker.undo();
    observer.clear();

    worker.undo();

    assert_eq!(worker.size(), 0);
    assert!(observer.errors.lock().unwrap().is_empty());
    assert!(observer.undo_counts.lock().unwrap().is_empty());
    assert!(snapshot(&worker, &observer).is_empty());
}

#[test]
fn import_records_no_undo() {
    let (mut worker, observer) = worker_with_observer();
    worker.import(&[
        Entry::new(100, "work", ""),
        Entry::new(200, "home", ""),
    ]);

    assert_eq!(worker.size(), 2);
    assert_eq!(worker.undo_count(), 0);
    assert_eq!(observer.imported.lock().unwrap().len(), 1);

    worker.undo();
    assert_eq!(worker.size(), 2);
    assert_eq!(snapshot(&worker, &observer).len(), 2);
}

#[test]
fn undo_count_events_track_pushes_and_pops() {
    let (mut worker, observer) = worker_with_observer();
    worker.insert(Entry::new(100, "work", ""));
    worker.insert(Entry::new(200, "work", ""));
    worker.undo();

    let counts = observer.undo_counts.lock().unwrap();
    assert_eq!(*counts, vec![1, 2, 1]);
}
