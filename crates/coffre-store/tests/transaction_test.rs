//! Transaction isolation and lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use coffre_store::{Db, Error, IterOptions, MasterKey, MemFs, Options};

fn new_db(fs: &MemFs) -> Db {
    let opts = Options {
        encryption_key: Some(MasterKey::new(&[0x02; 16]).expect("valid key")),
        fs: Arc::new(fs.clone()),
        ..Options::default()
    };
    Db::open("", &opts).expect("open")
}

#[test]
fn transaction_isolation() {
    let fs = MemFs::new();
    let db = new_db(&fs);
    let key = b"key";

    // arrange
    let mut tx = db.new_transaction(true).expect("tx");
    tx.set(key, b"value1").expect("set");
    tx.commit().expect("commit");

    // act
    let reader1 = db.new_transaction(false).expect("reader1");
    let mut writer = db.new_transaction(true).expect("writer");
    writer.set(key, b"value2").expect("set");
    let reader2 = db.new_transaction(false).expect("reader2");
    writer.commit().expect("commit");
    let reader3 = db.new_transaction(false).expect("reader3");

    // assert
    assert_eq!(&*reader1.get(key).expect("get"), b"value1");
    assert_eq!(&*reader2.get(key).expect("get"), b"value1");
    assert_eq!(&*reader3.get(key).expect("get"), b"value2");
}

#[test]
fn transaction_iterators_capture_batch_state_at_creation() {
    let fs = MemFs::new();
    let db = new_db(&fs);
    let key = b"key";

    let mut tx = db.new_transaction(true).expect("tx");
    tx.set(key, b"value1").expect("set");
    tx.commit().expect("commit");

    let reader1 = db.new_transaction(false).expect("reader1");
    let mut writer = db.new_transaction(true).expect("writer");

    let mut writer_it1 = writer.new_iter(&IterOptions::default()).expect("iter");
    writer.set(key, b"value2").expect("set");
    let mut writer_it2 = writer.new_iter(&IterOptions::default()).expect("iter");
    let reader2 = db.new_transaction(false).expect("reader2");

    // The iterator opened before the in-transaction write sees the old
    // value; the one opened after sees the new one.
    assert!(writer_it1.first());
    assert_eq!(writer_it1.key(), key);
    assert_eq!(writer_it1.value(), b"value1");

    assert!(writer_it2.first());
    assert_eq!(writer_it2.key(), key);
    assert_eq!(writer_it2.value(), b"value2");
    writer_it1.close().expect("close");
    writer_it2.close().expect("close");

    writer.commit().expect("commit");
    let reader3 = db.new_transaction(false).expect("reader3");

    for (reader, expected) in [
        (&reader1, b"value1".as_slice()),
        (&reader2, b"value1".as_slice()),
        (&reader3, b"value2".as_slice()),
    ] {
        let mut iter = reader.new_iter(&IterOptions::default()).expect("iter");
        assert!(iter.first());
        assert_eq!(iter.key(), key);
        assert_eq!(iter.value(), expected);
        iter.close().expect("close");
    }
}

#[test]
fn reads_inside_a_writable_transaction_see_its_own_writes() {
    let fs = MemFs::new();
    let db = new_db(&fs);
    db.set(b"a", b"committed", coffre_store::SYNC).expect("set");

    let mut tx = db.new_transaction(true).expect("tx");
    tx.set(b"b", b"in-batch").expect("set");
    tx.delete(b"a").expect("delete");

    assert_eq!(&*tx.get(b"b").expect("get"), b"in-batch");
    assert!(matches!(tx.get(b"a"), Err(Error::NotFound)));

    // Overwrites within the batch: the latest write wins.
    tx.set(b"b", b"in-batch-2").expect("set");
    assert_eq!(&*tx.get(b"b").expect("get"), b"in-batch-2");

    tx.close();
    // Nothing was committed.
    assert_eq!(&*db.get(b"a").expect("get"), b"committed");
    assert!(matches!(db.get(b"b"), Err(Error::NotFound)));
}

#[test]
fn write_on_read_only_transaction_fails() {
    let fs = MemFs::new();
    let db = new_db(&fs);
    let mut tx = db.new_transaction(false).expect("tx");
    assert!(matches!(tx.set(b"k", b"v"), Err(Error::InvalidArgument(_))));
    assert!(matches!(tx.commit(), Err(Error::InvalidArgument(_))));
}

#[test]
fn close_is_idempotent_and_valid_after_commit() {
    let fs = MemFs::new();
    let db = new_db(&fs);
    let mut tx = db.new_transaction(true).expect("tx");
    tx.set(b"k", b"v").expect("set");
    tx.commit().expect("commit");
    tx.close();
    tx.close();
    assert!(matches!(tx.commit(), Err(Error::InvalidArgument(_))));
    assert_eq!(&*db.get(b"k").expect("get"), b"v");
}

#[test]
fn dropping_an_uncommitted_transaction_discards_it() {
    let fs = MemFs::new();
    let db = new_db(&fs);
    {
        let mut tx = db.new_transaction(true).expect("tx");
        tx.set(b"k", b"v").expect("set");
    }
    assert!(matches!(db.get(b"k"), Err(Error::NotFound)));
}

#[test]
fn second_writer_blocks_until_first_closes() {
    let fs = MemFs::new();
    let db = Arc::new(new_db(&fs));

    let mut writer = db.new_transaction(true).expect("writer");
    writer.set(b"k", b"first").expect("set");

    let acquired = Arc::new(AtomicBool::new(false));
    let handle = {
        let db = Arc::clone(&db);
        let acquired = Arc::clone(&acquired);
        thread::spawn(move || {
            let mut second = db.new_transaction(true).expect("second writer");
            acquired.store(true, Ordering::SeqCst);
            second.set(b"k", b"second").expect("set");
            second.commit().expect("commit");
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(
        !acquired.load(Ordering::SeqCst),
        "second writer must block while the first is open"
    );

    writer.commit().expect("commit");
    handle.join().expect("join");
    assert!(acquired.load(Ordering::SeqCst));
    assert_eq!(&*db.get(b"k").expect("get"), b"second");
}

#[test]
fn merge_and_sized_deletes_flow_through_transactions() {
    let fs = MemFs::new();
    let db = new_db(&fs);

    let mut tx = db.new_transaction(true).expect("tx");
    tx.set(b"acc", b"base-").expect("set");
    tx.merge(b"acc", b"op").expect("merge");
    tx.log_data(b"audit trail entry").expect("log_data");
    tx.delete_sized(b"gone", 508).expect("delete_sized");
    tx.commit().expect("commit");

    assert_eq!(&*db.get(b"acc").expect("get"), b"base-op");
    assert!(matches!(db.get(b"gone"), Err(Error::NotFound)));
}

#[test]
fn snapshot_survives_a_flush() {
    let fs = MemFs::new();
    let db = new_db(&fs);
    db.set(b"k", b"before", coffre_store::SYNC).expect("set");

    let reader = db.new_transaction(false).expect("reader");
    db.set(b"k", b"after", coffre_store::SYNC).expect("set");
    db.flush().expect("flush");

    // The snapshot still reads the pre-flush state even though the
    // memtable it captured has since been replaced.
    assert_eq!(&*reader.get(b"k").expect("get"), b"before");
    assert_eq!(&*db.get(b"k").expect("get"), b"after");
}
