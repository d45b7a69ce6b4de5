use history_store::{HistoryFacade, Record};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

#[test]
fn eight_threads_each_appending_a_hundred_records_never_collide() {
    let dir = tempdir().unwrap();
    let facade = Arc::new(
        HistoryFacade::open(dir.path().to_string_lossy().to_string(), "proj").unwrap(),
    );

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let facade = Arc::clone(&facade);
            thread::spawn(move || {
                (0..100)
                    .map(|i| {
                        let record =
                            Record::new(json!({"thread": t, "seq": i})).unwrap();
                        facade.append(record).unwrap().0
                    })
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut gsns: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    gsns.sort_unstable();

    assert_eq!(gsns.len(), 800);
    let unique: HashSet<u64> = gsns.iter().copied().collect();
    assert_eq!(unique.len(), 800, "no two appends may share a GSN");
    assert_eq!(gsns, (1..=800).collect::<Vec<u64>>());

    assert_eq!(facade.total_count().unwrap(), 800);
    assert_eq!(facade.current_gsn().unwrap(), 800);

    let mut seen_gsns = HashSet::new();
    let mut offset = 0;
    loop {
        let page = facade.after_offset(offset, 64).unwrap();
        if page.is_empty() {
            break;
        }
        offset += page.len();
        for record in &page {
            seen_gsns.insert(record.gsn().unwrap());
        }
    }
    for archive_path in history_store::list_archives(facade.dir()).unwrap() {
        for record in history_store::read_archive_records(&archive_path).unwrap() {
            seen_gsns.insert(record.gsn().unwrap());
        }
    }
    assert_eq!(seen_gsns.len(), 800, "every appended record must be reachable");
}

#[test]
fn concurrent_appends_with_rotation_keep_every_record_readable() {
    let dir = tempdir().unwrap();
    let facade = Arc::new(
        HistoryFacade::builder(dir.path().to_string_lossy().to_string(), "proj")
            .max_records(20)
            .archive_batch(10)
            .open()
            .unwrap(),
    );

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let facade = Arc::clone(&facade);
            thread::spawn(move || {
                for i in 0..50 {
                    facade
                        .append(Record::new(json!({"i": i})).unwrap())
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(facade.total_count().unwrap(), 200);
    assert_eq!(facade.current_gsn().unwrap(), 200);
}
