mod common;

use asupersync::Cx;
use asupersync::runtime::RuntimeBuilder;
use common::{
    CountingConnection, expect_err, int, new_child, registry, session, session_with, unwrap_outcome,
};
use splitmodel::{Error, SaveOptions, SessionConfig, Value};

const UNIT_TABLES: [&str; 4] = [
    "testapp_child",
    "testapp_parenta",
    "testapp_parentb",
    "testapp_parentc",
];

#[test]
fn deleting_a_partially_loaded_record_removes_every_unit() {
    let rt = RuntimeBuilder::current_thread().build().unwrap();
    let cx = Cx::for_testing();
    let session = session(registry(), CountingConnection::open());

    rt.block_on(async {
        let mut keep = new_child(&session, "keep");
        unwrap_outcome(session.save(&cx, &mut keep, SaveOptions::new()).await);
        let mut gone = new_child(&session, "gone");
        unwrap_outcome(session.save(&cx, &mut gone, SaveOptions::new()).await);
        let gone_id = int(gone.pk());

        let objects = session.objects("Child").unwrap();
        let mut loaded = unwrap_outcome(objects.filter("pk", gone_id).get(&cx).await);
        let summary = unwrap_outcome(session.delete(&cx, &mut loaded).await);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.per_model.get("ParentC"), Some(&1));
        assert_eq!(loaded.pk().filter(|v| !v.is_null()), None);
    });

    let conn = session.connection();
    for table in UNIT_TABLES {
        assert_eq!(conn.count_rows(table), 1, "{table}");
    }
    assert_eq!(
        conn.column("SELECT \"para_name\" FROM \"testapp_parenta\""),
        vec![Value::Text("keep-a".into())]
    );
}

#[test]
fn deleting_an_owner_cascades_into_every_unit() {
    let rt = RuntimeBuilder::current_thread().build().unwrap();
    let cx = Cx::for_testing();
    let session = session(registry(), CountingConnection::open());

    rt.block_on(async {
        let mut user = session.new_record("User").unwrap();
        user.set("username", "ann").unwrap();
        unwrap_outcome(session.save(&cx, &mut user, SaveOptions::new()).await);

        for name in ["c1", "c2"] {
            let mut child = new_child(&session, name);
            child.set_related("user", Some(&user)).unwrap();
            unwrap_outcome(session.save(&cx, &mut child, SaveOptions::new()).await);
        }
        let mut orphan = new_child(&session, "c3");
        unwrap_outcome(session.save(&cx, &mut orphan, SaveOptions::new()).await);

        let summary = unwrap_outcome(session.delete(&cx, &mut user).await);
        assert_eq!(summary.total, 9);
        assert_eq!(summary.per_model.get("Child"), Some(&2));
    });

    let conn = session.connection();
    assert_eq!(conn.count_rows("auth_user"), 0);
    for table in UNIT_TABLES {
        assert_eq!(conn.count_rows(table), 1, "{table}");
    }
}

#[test]
fn queryset_delete_removes_matching_records() {
    let rt = RuntimeBuilder::current_thread().build().unwrap();
    let cx = Cx::for_testing();
    let session = session(registry(), CountingConnection::open());

    rt.block_on(async {
        for name in ["a1", "a2", "b1"] {
            let mut child = new_child(&session, name);
            unwrap_outcome(session.save(&cx, &mut child, SaveOptions::new()).await);
        }
        let objects = session.objects("Child").unwrap();
        let summary = unwrap_outcome(objects.filter("parb_name", "b1-b").delete(&cx).await);
        assert_eq!(summary.total, 4);

        let err = expect_err(objects.limit(1).delete(&cx).await);
        assert!(matches!(err, Error::Usage(_)));
        assert_eq!(unwrap_outcome(objects.count(&cx).await), 2);
    });

    let conn = session.connection();
    for table in UNIT_TABLES {
        assert_eq!(conn.count_rows(table), 2, "{table}");
    }
}

#[test]
fn deleting_more_records_than_one_batch_holds() {
    let rt = RuntimeBuilder::current_thread().build().unwrap();
    let cx = Cx::for_testing();
    let config = SessionConfig::new().bulk_batch_size(3);
    let session = session_with(registry(), CountingConnection::open(), config);
    let mut records: Vec<_> = (0..7).map(|i| new_child(&session, &format!("c{i}"))).collect();

    rt.block_on(async {
        let objects = session.objects("Child").unwrap();
        unwrap_outcome(objects.bulk_create(&cx, &mut records).await);
        session.connection().reset();

        let summary = unwrap_outcome(objects.delete(&cx).await);
        assert_eq!(summary.total, 28);
        assert_eq!(summary.per_model.get("Child"), Some(&7));
        assert_eq!(summary.per_model.get("ParentB"), Some(&7));
    });

    let conn = session.connection();
    let deletes = conn
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("DELETE"))
        .count();
    assert_eq!(deletes, 12);
    for table in UNIT_TABLES {
        assert_eq!(conn.count_rows(table), 0, "{table}");
    }
}
