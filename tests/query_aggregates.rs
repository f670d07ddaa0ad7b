//! # Aggregation Query Tests
//!
//! End-to-end coverage of the query surface: aggregates over full
//! databases and cursor-bounded ranges, predicate plugins, transactional
//! staging visible through the merge reader, and the status codes for
//! malformed or misdirected queries.

use loamdb::{
    CancelToken, DbConfig, DbError, Env, EnvOptions, FindFlags, InsertFlags, KeyType, Value,
};
use tempfile::tempdir;

fn small_env(dir: &tempfile::TempDir) -> Env {
    let options = EnvOptions::new().page_size(1024).cache_capacity(64);
    Env::create(dir.path().join("query.loam"), options).unwrap()
}

fn status(err: &eyre::Report) -> Option<&DbError> {
    DbError::of(err)
}

fn insert_btree(env: &mut Env, db: u16, key: u32) {
    env.insert(db, None, &key.to_le_bytes(), b"", InsertFlags::empty())
        .unwrap();
}

fn insert_txn_stripe(env: &mut Env, db: u16, keys: impl Iterator<Item = u32>) {
    let txn = env.txn_begin(db).unwrap();
    for key in keys {
        env.insert(db, Some(&txn), &key.to_le_bytes(), b"", InsertFlags::empty())
            .unwrap();
    }
    env.txn_commit(txn).unwrap();
}

#[test]
fn sum_over_ten_sequential_keys() {
    // Keys 0..9 with empty records: SUM($key) = 45.
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();
    for key in 0u32..10 {
        insert_btree(&mut env, 1, key);
    }

    let result = env.select("SUM($key) from database 1").unwrap();
    assert_eq!(result.name, "SUM");
    assert_eq!(result.value, Value::U64(45));
}

#[test]
fn count_large_database() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32).compressed(true))
        .unwrap();
    for key in 0u32..1000 {
        insert_btree(&mut env, 1, key);
    }

    let result = env.select("coUNT ($key) from database 1").unwrap();
    assert_eq!(result.name, "COUNT");
    assert_eq!(result.value, Value::U64(1000));
}

#[test]
fn count_with_transaction_stripe() {
    // btree 0..99, staged 100..119, btree 120..299: COUNT = 300.
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();

    for key in 0u32..100 {
        insert_btree(&mut env, 1, key);
    }
    insert_txn_stripe(&mut env, 1, 100u32..120);
    for key in 120u32..300 {
        insert_btree(&mut env, 1, key);
    }

    let result = env.select("COUNT($key) from database 1").unwrap();
    assert_eq!(result.value, Value::U64(300));

    let result = env.select("SUM($key) from database 1").unwrap();
    assert_eq!(result.value, Value::U64((0..300u64).sum()));
}

#[test]
fn sum_mixed_stripes() {
    // btree / txn / btree / txn / btree, summing after each stripe.
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();
    let mut sum = 0u64;

    for key in [1u32, 2, 3] {
        insert_btree(&mut env, 1, key);
        sum += key as u64;
    }
    let result = env.select("SUM($key) from database 1").unwrap();
    assert_eq!(result.value, Value::U64(sum));

    insert_txn_stripe(&mut env, 1, 4u32..7);
    sum += 4 + 5 + 6;
    let result = env.select("SUM($key) from database 1").unwrap();
    assert_eq!(result.value, Value::U64(sum));

    for key in [7u32, 8, 9] {
        insert_btree(&mut env, 1, key);
        sum += key as u64;
    }
    insert_txn_stripe(&mut env, 1, 10u32..13);
    sum += 10 + 11 + 12;
    for key in [13u32, 14, 15] {
        insert_btree(&mut env, 1, key);
        sum += key as u64;
    }

    let result = env.select("SUM($key) from database 1").unwrap();
    assert_eq!(result.value, Value::U64(sum));
}

#[test]
fn sum_mixed_stripes_starting_with_txn() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();
    let mut sum = 0u64;

    insert_txn_stripe(&mut env, 1, 1u32..4);
    sum += 1 + 2 + 3;
    let result = env.select("SUM($key) from database 1").unwrap();
    assert_eq!(result.value, Value::U64(sum));

    for key in [4u32, 5, 6] {
        insert_btree(&mut env, 1, key);
        sum += key as u64;
    }
    insert_txn_stripe(&mut env, 1, 7u32..10);
    sum += 7 + 8 + 9;
    for key in [10u32, 11, 12] {
        insert_btree(&mut env, 1, key);
        sum += key as u64;
    }
    insert_txn_stripe(&mut env, 1, 13u32..16);
    sum += 13 + 14 + 15;

    let result = env.select("SUM($key) from database 1").unwrap();
    assert_eq!(result.value, Value::U64(sum));
}

#[test]
fn staged_overwrite_wins_ties() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();

    for key in 0u32..10 {
        env.insert(1, None, &key.to_le_bytes(), &8u64.to_le_bytes(), InsertFlags::empty())
            .unwrap();
    }

    // Stage overwrites for half of the keys with a different record.
    let txn = env.txn_begin(1).unwrap();
    for key in (0u32..10).step_by(2) {
        env.insert(
            1,
            Some(&txn),
            &key.to_le_bytes(),
            &100u64.to_le_bytes(),
            InsertFlags::OVERWRITE,
        )
        .unwrap();
    }
    env.txn_commit(txn).unwrap();

    // Exactly ten rows; staged records override on equal keys.
    let count = env.select("COUNT($key) from database 1").unwrap();
    assert_eq!(count.value, Value::U64(10));
    let sum = env.select("SUM($record) from database 1").unwrap();
    assert_eq!(sum.value, Value::U64(5 * 8 + 5 * 100));

    // Point reads see the staged record too.
    let hit = env.find(1, &2u32.to_le_bytes(), FindFlags::empty()).unwrap();
    assert_eq!(hit.record, 100u64.to_le_bytes());
}

#[test]
fn flush_drains_staging_without_changing_results() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();

    for key in 0u32..50 {
        insert_btree(&mut env, 1, key);
    }
    insert_txn_stripe(&mut env, 1, 50u32..80);

    let before = env.select("SUM($key) from database 1").unwrap();
    env.flush().unwrap();
    let after = env.select("SUM($key) from database 1").unwrap();
    assert_eq!(before, after);
    assert_eq!(after.value, Value::U64((0..80u64).sum()));
}

#[test]
fn predicate_even_filters_sum() {
    // Keys 0..9, SUM($key) where even($key) = 20.
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();
    for key in 0u32..10 {
        insert_btree(&mut env, 1, key);
    }

    env.register_predicate(
        "even",
        Box::new(|data| {
            let value = u32::from_le_bytes(data[..4].try_into().unwrap());
            value % 2 == 0
        }),
    );

    let result = env
        .select("SUM($key) from database 1 WHERE even($key)")
        .unwrap();
    assert_eq!(result.value, Value::U64(20));
}

#[test]
fn predicate_over_records() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::Binary)).unwrap();

    for i in 0u8..20 {
        env.insert(1, None, &[b'k', i], &[i], InsertFlags::empty())
            .unwrap();
    }

    env.register_predicate("first_byte_even", Box::new(|data| data[0] % 2 == 0));

    let result = env
        .select("COUNT($key) from database 1 WHERE first_byte_even($record)")
        .unwrap();
    assert_eq!(result.value, Value::U64(10));
}

#[test]
fn average_over_float_keys() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::F32)).unwrap();

    let count = 20;
    let mut sum = 0.0f64;
    for i in 0..count {
        let f = i as f32;
        env.insert(1, None, &f.to_le_bytes(), b"", InsertFlags::empty())
            .unwrap();
        sum += f as f64;
    }

    let result = env.select("average($key) from database 1").unwrap();
    assert_eq!(result.name, "AVERAGE");
    assert_eq!(result.value, Value::F64(sum / count as f64));
}

#[test]
fn select_range_from_cursor() {
    // Keys 0..9: SUM from FIRST = 45, SUM from find(5) = 35.
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();
    for key in 0u32..10 {
        insert_btree(&mut env, 1, key);
    }

    let cursor = env.cursor_create(1).unwrap();
    env.cursor_first(&cursor).unwrap();
    let result = env
        .select_range("SUM($key) from database 1", Some(&cursor), None)
        .unwrap();
    assert_eq!(result.value, Value::U64(45));

    env.cursor_find(&cursor, &5u32.to_le_bytes(), FindFlags::empty())
        .unwrap();
    let result = env
        .select_range("SUM($key) from database 1", Some(&cursor), None)
        .unwrap();
    assert_eq!(result.value, Value::U64(5 + 6 + 7 + 8 + 9));
}

#[test]
fn select_range_up_to_end_cursor() {
    // Keys 0..199; the end cursor at 100 bounds the range exclusively.
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();
    for key in 0u32..200 {
        insert_btree(&mut env, 1, key);
    }

    let cursor = env.cursor_create(1).unwrap();
    env.cursor_find(&cursor, &100u32.to_le_bytes(), FindFlags::empty())
        .unwrap();

    let result = env
        .select_range("COUNT($key) from database 1", None, Some(&cursor))
        .unwrap();
    assert_eq!(result.value, Value::U64(100));

    let result = env
        .select_range("SUM($key) from database 1", None, Some(&cursor))
        .unwrap();
    assert_eq!(result.value, Value::U64((0..100u64).sum()));
}

#[test]
fn select_range_end_cursor_on_staged_key() {
    // btree 0..99, staged 100..119, btree 120..299; an end cursor parked
    // on a staged-only key still bounds the range.
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();

    for key in 0u32..100 {
        insert_btree(&mut env, 1, key);
    }
    insert_txn_stripe(&mut env, 1, 100u32..120);
    for key in 120u32..300 {
        insert_btree(&mut env, 1, key);
    }

    let cursor = env.cursor_create(1).unwrap();
    env.cursor_find(&cursor, &100u32.to_le_bytes(), FindFlags::empty())
        .unwrap();

    let result = env
        .select_range("COUNT($key) from database 1", None, Some(&cursor))
        .unwrap();
    assert_eq!(result.value, Value::U64(100));

    let result = env
        .select_range("SUM($key) from database 1", None, Some(&cursor))
        .unwrap();
    assert_eq!(result.value, Value::U64((0..100u64).sum()));

    env.cursor_find(&cursor, &110u32.to_le_bytes(), FindFlags::empty())
        .unwrap();
    let result = env
        .select_range("COUNT($key) from database 1", None, Some(&cursor))
        .unwrap();
    assert_eq!(result.value, Value::U64(110));
}

#[test]
fn nil_and_foreign_cursors_are_rejected() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();
    env.create_db(2, DbConfig::new(KeyType::U32)).unwrap();
    for key in 0u32..10 {
        insert_btree(&mut env, 1, key);
    }

    // A nil cursor cannot bound a range.
    let nil_cursor = env.cursor_create(1).unwrap();
    let err = env
        .select_range("SUM($key) from database 1", Some(&nil_cursor), None)
        .unwrap_err();
    assert_eq!(status(&err), Some(&DbError::CursorIsNil));

    // A cursor from database 1 cannot drive a query on database 2.
    let cursor = env.cursor_create(1).unwrap();
    env.cursor_first(&cursor).unwrap();
    let err = env
        .select_range("SUM($key) from database 2", Some(&cursor), None)
        .unwrap_err();
    assert!(matches!(status(&err), Some(DbError::InvalidParameter(_))));
}

#[test]
fn sum_over_binary_keys_is_a_parser_error() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::Binary)).unwrap();
    for key in [&b"hello again"[..], b"ich sag einfach", b"hello again..."] {
        env.insert(1, None, key, b"", InsertFlags::empty()).unwrap();
    }

    let err = env.select("SUM($key) from database 1").unwrap_err();
    assert!(matches!(status(&err), Some(DbError::ParserError(_))));
    let err = env.select("average($key) from database 1").unwrap_err();
    assert!(matches!(status(&err), Some(DbError::ParserError(_))));
}

#[test]
fn unknown_database_is_invalid() {
    let dir = tempdir().unwrap();
    let env = small_env(&dir);
    let err = env.select("SUM($key) from database 100").unwrap_err();
    assert!(matches!(status(&err), Some(DbError::InvalidParameter(_))));
}

#[test]
fn unknown_predicate_is_plugin_not_found() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();
    insert_btree(&mut env, 1, 1);

    let err = env
        .select("SUM($key) from database 1 WHERE missing($key)")
        .unwrap_err();
    assert_eq!(
        status(&err),
        Some(&DbError::PluginNotFound("missing".to_string()))
    );
}

#[test]
fn malformed_query_is_a_parser_error() {
    let dir = tempdir().unwrap();
    let env = small_env(&dir);
    for bad in ["", "SUM", "SUM($key) of database 1", "SUM($key) from database x"] {
        let err = env.select(bad).unwrap_err();
        assert!(matches!(status(&err), Some(DbError::ParserError(_))), "{bad:?}");
    }
}

#[test]
fn binary_keys_mixed_with_staged_short_keys() {
    // 24 long committed keys plus 24 short staged keys interleaved
    // between them: COUNT sees all 48.
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::Binary)).unwrap();

    for i in 0..24u8 {
        let long = vec![b'a' + i; 31];
        env.insert(1, None, &long, b"", InsertFlags::empty()).unwrap();
    }

    let txn = env.txn_begin(1).unwrap();
    for i in 0..24u8 {
        env.insert(1, Some(&txn), &[b'a' + i], b"", InsertFlags::empty())
            .unwrap();
    }
    env.txn_commit(txn).unwrap();

    let result = env.select("COUNT($key) from database 1").unwrap();
    assert_eq!(result.value, Value::U64(48));
}

#[test]
fn aborted_transactions_stay_invisible() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();
    for key in 0u32..10 {
        insert_btree(&mut env, 1, key);
    }

    let txn = env.txn_begin(1).unwrap();
    for key in 10u32..20 {
        env.insert(1, Some(&txn), &key.to_le_bytes(), b"", InsertFlags::empty())
            .unwrap();
    }
    env.txn_abort(txn).unwrap();

    let result = env.select("COUNT($key) from database 1").unwrap();
    assert_eq!(result.value, Value::U64(10));
    assert!(env.find(1, &15u32.to_le_bytes(), FindFlags::empty()).is_err());
}

#[test]
fn staged_duplicate_detection_spans_tree_and_staging() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();
    insert_btree(&mut env, 1, 7);

    let txn = env.txn_begin(1).unwrap();
    let err = env
        .insert(1, Some(&txn), &7u32.to_le_bytes(), b"", InsertFlags::empty())
        .unwrap_err();
    assert_eq!(status(&err), Some(&DbError::DuplicateKey));

    env.insert(1, Some(&txn), &8u32.to_le_bytes(), b"", InsertFlags::empty())
        .unwrap();
    let err = env
        .insert(1, Some(&txn), &8u32.to_le_bytes(), b"", InsertFlags::empty())
        .unwrap_err();
    assert_eq!(status(&err), Some(&DbError::DuplicateKey));
    env.txn_commit(txn).unwrap();

    // Staged keys stay duplicates for plain inserts after commit.
    let err = env
        .insert(1, None, &8u32.to_le_bytes(), b"", InsertFlags::empty())
        .unwrap_err();
    assert_eq!(status(&err), Some(&DbError::DuplicateKey));
}

#[test]
fn cancelled_scan_stops() {
    let dir = tempdir().unwrap();
    let mut env = small_env(&dir);
    env.create_db(1, DbConfig::new(KeyType::U32)).unwrap();
    for key in 0u32..500 {
        insert_btree(&mut env, 1, key);
    }

    let token = CancelToken::new();
    token.cancel();
    let err = env
        .select_with_cancel("COUNT($key) from database 1", token)
        .unwrap_err();
    assert!(err.to_string().contains("cancelled"));
}

#[test]
fn results_survive_flush_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.loam");
    let options = EnvOptions::new().page_size(1024).cache_capacity(64);

    let expected: u64 = (0..100u64).sum();
    {
        let mut env = Env::create(&path, options.clone()).unwrap();
        env.create_db(1, DbConfig::new(KeyType::U32).compressed(true))
            .unwrap();
        for key in 0u32..50 {
            insert_btree(&mut env, 1, key);
        }
        insert_txn_stripe(&mut env, 1, 50u32..100);
        env.flush().unwrap();
    }

    let env = Env::open(&path, options).unwrap();
    let result = env.select("SUM($key) from database 1").unwrap();
    assert_eq!(result.value, Value::U64(expected));
    let result = env.select("COUNT($key) from database 1").unwrap();
    assert_eq!(result.value, Value::U64(100));
}
