//! Tamper detection: bit flips, fork substitution, and salt-chain damage.

use std::sync::Arc;

use coffre_store::{vfs::Fs, Db, MasterKey, MemFs, Options, SALT_CHAIN_FILENAME, SYNC};

const SALT_BLOCK_LEN: usize = 56;

fn test_options(fs: &MemFs) -> Options {
    Options {
        encryption_key: Some(MasterKey::new(&[0x02; 16]).expect("valid key")),
        fs: Arc::new(fs.clone()),
        ..Options::default()
    }
}

/// Copy every file under `src_dir` of `src` into `dst_dir` of `dst`.
fn clone_dir(src: &MemFs, src_dir: &str, dst: &MemFs, dst_dir: &str) {
    let prefix = |dir: &str, name: &str| {
        if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        }
    };
    for name in src.list(src_dir).expect("list") {
        let raw = src.read_file(&prefix(src_dir, &name)).expect("read_file");
        dst.put_file(&prefix(dst_dir, &name), raw).expect("put_file");
    }
}

/// A populated store: one flushed table, one live WAL entry.
fn build_store() -> MemFs {
    let fs = MemFs::new();
    let opts = test_options(&fs);
    let db = Db::open("", &opts).expect("open");
    db.set(b"foo", b"bar", SYNC).expect("set");
    db.set(b"key1", b"val1", SYNC).expect("set");
    db.flush().expect("flush");
    db.set(b"key2", b"val2", SYNC).expect("set");
    db.close().expect("close");
    fs
}

#[test]
fn every_flipped_bit_is_detected() {
    let fs = build_store();
    let names: Vec<String> = fs.list("").expect("list");
    assert!(names.iter().any(|n| n.ends_with(".sst")));

    for name in &names {
        if name == "CURRENT" {
            continue;
        }
        let raw = fs.read_file(name).expect("read_file");
        for pos in 0..raw.len() {
            let clone = MemFs::new();
            clone_dir(&fs, "", &clone, "");
            let mut tampered = raw.clone();
            tampered[pos] ^= 1;
            clone.put_file(name, tampered).expect("put_file");

            let opts = test_options(&clone);
            let message = match Db::open("", &opts) {
                Err(err) => format!("{err}"),
                Ok(db) => {
                    // Open can only succeed when the flip sits in a table
                    // data block, which the open path does not read; the
                    // point lookup must then fail.
                    let err = db
                        .get(b"key1")
                        .err()
                        .unwrap_or_else(|| panic!("{name}: flip at byte {pos} went undetected"));
                    format!("{err}")
                }
            };
            assert!(
                message.contains("cipher: message authentication failed")
                    || message.contains("invalid mac")
                    || message.contains("invalid chunk"),
                "{name}: flip at byte {pos} produced unexpected error: {message}"
            );
        }
    }
}

#[test]
fn fork_table_substitution_is_rejected() {
    let fs = MemFs::new();
    let opts = test_options(&fs);

    // Common history.
    let db = Db::open("db", &opts).expect("open");
    db.set(b"key1", b"val1", SYNC).expect("set");
    db.close().expect("close");
    clone_dir(&fs, "db", &fs, "fork");

    // Diverge: both write the same key and flush, producing a table with
    // the same file number on both sides.
    let db = Db::open("db", &opts).expect("open db");
    let fork = Db::open("fork", &opts).expect("open fork");
    db.set(b"key2", b"val2", SYNC).expect("set");
    fork.set(b"key2", b"val2", SYNC).expect("set");
    db.flush().expect("flush");
    fork.flush().expect("flush");
    db.close().expect("close");
    fork.close().expect("close");

    let sst_name = fs
        .list("db")
        .expect("list")
        .into_iter()
        .filter(|n| n.ends_with(".sst"))
        .max()
        .expect("a flushed table");
    assert!(
        fs.list("fork").expect("list").contains(&sst_name),
        "fork must have produced the same table file number"
    );

    // Substitute the fork's table into db.
    let forged = fs.read_file(&format!("fork/{sst_name}")).expect("read_file");
    fs.put_file(&format!("db/{sst_name}"), forged).expect("put_file");

    // The fork's table was sealed under a different per-file key (same
    // file number, different salt), so authentication fails.
    let message = match Db::open("db", &opts) {
        Err(err) => format!("{err}"),
        Ok(db) => format!("{}", db.get(b"key2").expect_err("forged table")),
    };
    assert!(message.contains("backing file"), "got: {message}");
    assert!(
        message.contains("cipher: message authentication failed"),
        "got: {message}"
    );
}

#[test]
fn salt_chain_truncation_fails_open() {
    let fs = build_store();
    let chain = fs.read_file(SALT_CHAIN_FILENAME).expect("read_file");
    assert_eq!(chain.len() % SALT_BLOCK_LEN, 0);
    let blocks = chain.len() / SALT_BLOCK_LEN;
    assert!(blocks >= 4);

    for removed in 1..blocks {
        let clone = MemFs::new();
        clone_dir(&fs, "", &clone, "");
        let mut truncated = chain.clone();
        truncated.truncate(chain.len() - removed * SALT_BLOCK_LEN);
        clone.put_file(SALT_CHAIN_FILENAME, truncated).expect("put_file");

        let err = Db::open("", &test_options(&clone)).expect_err("truncated chain");
        assert!(
            format!("{err}").contains("invalid mac"),
            "removing {removed} blocks produced: {err}"
        );
    }
}

#[test]
fn salt_chain_partial_block_fails_open() {
    let fs = build_store();
    let clone = MemFs::new();
    clone_dir(&fs, "", &clone, "");
    let mut chain = fs.read_file(SALT_CHAIN_FILENAME).expect("read_file");
    chain.truncate(chain.len() - 13);
    clone.put_file(SALT_CHAIN_FILENAME, chain).expect("put_file");

    let err = Db::open("", &test_options(&clone)).expect_err("partial block");
    assert!(format!("{err}").contains("invalid mac"));
}

#[test]
fn salt_chain_overwrite_fails_open() {
    let fs = build_store();
    let chain = fs.read_file(SALT_CHAIN_FILENAME).expect("read_file");

    for pos in 0..chain.len() {
        let clone = MemFs::new();
        clone_dir(&fs, "", &clone, "");
        let mut tampered = chain.clone();
        tampered[pos] ^= 0xff;
        clone.put_file(SALT_CHAIN_FILENAME, tampered).expect("put_file");

        let err = Db::open("", &test_options(&clone)).expect_err("tampered chain");
        assert!(
            format!("{err}").contains("invalid mac"),
            "overwrite at byte {pos} produced: {err}"
        );
    }
}

#[test]
fn wrong_master_key_fails_open() {
    let fs = build_store();
    let opts = Options {
        encryption_key: Some(MasterKey::new(&[0x03; 16]).expect("valid key")),
        fs: Arc::new(fs.clone()),
        ..Options::default()
    };
    let err = Db::open("", &opts).expect_err("wrong key");
    assert!(format!("{err}").contains("invalid mac"));
}

#[test]
fn short_master_key_is_rejected() {
    assert!(MasterKey::new(&[0x02; 15]).is_err());
    assert!(MasterKey::new(&[]).is_err());
}
