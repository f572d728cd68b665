mod common;

use asupersync::Cx;
use asupersync::runtime::RuntimeBuilder;
use common::{
    CountingConnection, expect_err, int, new_child, registry, session, unwrap_outcome,
};
use splitmodel::{Error, IntegrityErrorKind, SaveOptions, Value};

#[test]
fn new_split_record_writes_every_unit_with_one_identity() {
    let rt = RuntimeBuilder::current_thread().build().unwrap();
    let cx = Cx::for_testing();
    let session = session(registry(), CountingConnection::open());

    rt.block_on(async {
        let mut child = new_child(&session, "c1");
        unwrap_outcome(session.save(&cx, &mut child, SaveOptions::new()).await);
        let id = int(child.pk());
        for attname in ["aid", "bid", "cid"] {
            assert_eq!(int(child.value(attname)), id);
        }
        assert!(!child.is_adding());

        let statements = session.connection().statements();
        assert_eq!(statements.first().map(String::as_str), Some("BEGIN"));
        assert!(statements[1].starts_with("INSERT INTO \"testapp_child\""));
        assert!(statements[2].starts_with("INSERT INTO \"testapp_parenta\""));
        assert!(statements[3].starts_with("INSERT INTO \"testapp_parentb\""));
        assert!(statements[4].starts_with("INSERT INTO \"testapp_parentc\""));
        assert_eq!(statements.last().map(String::as_str), Some("COMMIT"));
    });

    let conn = session.connection();
    let child_id = conn.column("SELECT \"id\" FROM \"testapp_child\"");
    assert_eq!(child_id.len(), 1);
    for sql in [
        "SELECT \"aid\" FROM \"testapp_parenta\"",
        "SELECT \"bid\" FROM \"testapp_parentb\"",
        "SELECT \"cid\" FROM \"testapp_parentc\"",
    ] {
        assert_eq!(conn.column(sql), child_id);
    }
}

#[test]
fn insert_without_generated_keys_fails_before_writing() {
    let rt = RuntimeBuilder::current_thread().build().unwrap();
    let cx = Cx::for_testing();
    let session = session(registry(), CountingConnection::open().without_generated_keys());

    rt.block_on(async {
        let mut child = new_child(&session, "c1");
        let err = expect_err(session.save(&cx, &mut child, SaveOptions::new()).await);
        assert!(matches!(err, Error::Capability(ref c) if c.feature == "can_return_columns_from_insert"));
        assert!(session.connection().statements().is_empty());

        // a pre-supplied identity needs no generated key
        child.set("id", 7).unwrap();
        unwrap_outcome(session.save(&cx, &mut child, SaveOptions::new()).await);
    });
    assert_eq!(session.connection().count_rows("testapp_child"), 1);
    let cid = session.connection().column("SELECT \"cid\" FROM \"testapp_parentc\"");
    assert_eq!(cid.iter().filter_map(Value::as_i64).collect::<Vec<_>>(), vec![7]);
}

#[test]
fn saving_a_deferred_record_leaves_unloaded_units_alone() {
    let rt = RuntimeBuilder::current_thread().build().unwrap();
    let cx = Cx::for_testing();
    let session = session(registry(), CountingConnection::open());

    rt.block_on(async {
        let mut child = new_child(&session, "c1");
        unwrap_outcome(session.save(&cx, &mut child, SaveOptions::new()).await);

        // another writer changes ParentA behind the loaded record's back
        session
            .connection()
            .inner()
            .execute_sync("UPDATE \"testapp_parenta\" SET \"para_name\" = 'other'", &[])
            .unwrap();

        let mut loaded = unwrap_outcome(session.objects("Child").unwrap().get(&cx).await);
        loaded.set("child_name", "renamed").unwrap();
        session.connection().reset();
        unwrap_outcome(session.save(&cx, &mut loaded, SaveOptions::new()).await);

        let statements = session.connection().statements();
        assert!(statements.iter().any(|s| s.starts_with("UPDATE \"testapp_child\"")));
        assert!(!statements.iter().any(|s| s.starts_with("UPDATE \"testapp_parent")));
    });

    let conn = session.connection();
    assert_eq!(conn.column("SELECT \"child_name\" FROM \"testapp_child\""), vec![Value::Text("renamed".into())]);
    assert_eq!(conn.column("SELECT \"para_name\" FROM \"testapp_parenta\""), vec![Value::Text("other".into())]);
}

#[test]
fn updating_a_fully_loaded_record_writes_each_unit() {
    let rt = RuntimeBuilder::current_thread().build().unwrap();
    let cx = Cx::for_testing();
    let session = session(registry(), CountingConnection::open());

    rt.block_on(async {
        let mut child = new_child(&session, "c1");
        unwrap_outcome(session.save(&cx, &mut child, SaveOptions::new()).await);

        let qs = session.objects("Child").unwrap().select_related(&[]);
        let mut loaded = unwrap_outcome(qs.get(&cx).await);
        loaded.set("parb_name", "new-b").unwrap();
        unwrap_outcome(session.save(&cx, &mut loaded, SaveOptions::new()).await);

        let only_c = SaveOptions::new().update_fields(["parc_name"]);
        loaded.set("parc_name", "new-c").unwrap();
        loaded.set("child_name", "ignored").unwrap();
        unwrap_outcome(session.save(&cx, &mut loaded, only_c).await);
    });

    let conn = session.connection();
    assert_eq!(conn.column("SELECT \"parb_name\" FROM \"testapp_parentb\""), vec![Value::Text("new-b".into())]);
    assert_eq!(conn.column("SELECT \"parc_name\" FROM \"testapp_parentc\""), vec![Value::Text("new-c".into())]);
    assert_eq!(conn.column("SELECT \"child_name\" FROM \"testapp_child\""), vec![Value::Text("c1".into())]);
    assert_eq!(conn.count_rows("testapp_parenta"), 1);
}

#[test]
fn bulk_create_assigns_one_identity_per_record() {
    let rt = RuntimeBuilder::current_thread().build().unwrap();
    let cx = Cx::for_testing();
    let session = session(registry(), CountingConnection::open());
    let mut records = vec![
        new_child(&session, "a"),
        new_child(&session, "b").with("id", 100).unwrap(),
        new_child(&session, "c"),
    ];

    rt.block_on(async {
        let qs = session.objects("Child").unwrap();
        unwrap_outcome(qs.bulk_create(&cx, &mut records).await);
    });

    let ids: Vec<i64> = records.iter().map(|r| int(r.pk())).collect();
    assert_eq!(ids[1], 100);
    let distinct: std::collections::BTreeSet<i64> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), 3);
    for record in &records {
        let id = int(record.pk());
        for attname in ["aid", "bid", "cid"] {
            assert_eq!(int(record.value(attname)), id);
        }
    }

    let conn = session.connection();
    let mut expected: Vec<i64> = ids.clone();
    expected.sort_unstable();
    for sql in [
        "SELECT \"id\" FROM \"testapp_child\" ORDER BY \"id\"",
        "SELECT \"aid\" FROM \"testapp_parenta\" ORDER BY \"aid\"",
        "SELECT \"bid\" FROM \"testapp_parentb\" ORDER BY \"bid\"",
        "SELECT \"cid\" FROM \"testapp_parentc\" ORDER BY \"cid\"",
    ] {
        let found: Vec<i64> = conn.column(sql).iter().filter_map(Value::as_i64).collect();
        assert_eq!(found, expected);
    }
}

#[test]
fn bulk_create_with_a_mismatched_unit_key_keeps_nothing() {
    let rt = RuntimeBuilder::current_thread().build().unwrap();
    let cx = Cx::for_testing();
    let session = session(registry(), CountingConnection::open());
    let mut records = vec![
        new_child(&session, "a"),
        new_child(&session, "b").with("id", 7).unwrap().with("bid", 8).unwrap(),
    ];

    rt.block_on(async {
        let qs = session.objects("Child").unwrap();
        let err = expect_err(qs.bulk_create(&cx, &mut records).await);
        assert!(matches!(
            err,
            Error::Integrity(ref e) if e.kind == IntegrityErrorKind::SharedIdentityMismatch
        ));
    });

    let conn = session.connection();
    for table in ["testapp_child", "testapp_parenta", "testapp_parentb", "testapp_parentc"] {
        assert_eq!(conn.count_rows(table), 0, "{table}");
    }
}

#[test]
fn signals_report_creation_then_update() {
    use splitmodel::{ModelSignal, SignalKind};
    use std::sync::{Arc, Mutex};

    let rt = RuntimeBuilder::current_thread().build().unwrap();
    let cx = Cx::for_testing();
    let mut session = session(registry(), CountingConnection::open());
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&seen);
    session.signals_mut().connect(SignalKind::PostSave, move |signal| {
        if let ModelSignal::PostSave { model, created, .. } = signal {
            sink.lock().unwrap().push(format!("{model}:{created}"));
        }
        Ok(())
    });

    rt.block_on(async {
        let mut child = new_child(&session, "c1");
        unwrap_outcome(session.save(&cx, &mut child, SaveOptions::new()).await);
        child.set("child_name", "c2").unwrap();
        unwrap_outcome(session.save(&cx, &mut child, SaveOptions::new()).await);
    });
    assert_eq!(*seen.lock().unwrap(), vec!["Child:true", "Child:false"]);
}
