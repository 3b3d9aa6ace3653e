mod common;

use backup_engine::control::{Disk, Retrying};
use backup_engine::events::{Event, MemorySink};
use backup_engine::executor::{BackupExecutor, BackupJob, RestoreExecutor, RestoreOptions};
use backup_engine::journal::RestoreContext;
use backup_engine::metadata::BackupMetadata;
use backup_engine::utils::retry::RetryPolicy;
use backup_engine::{BackupError, Config};
use common::{
    config, frozen_part, merge_tree, table, FakeCoordination, FakeDatabase, FakeStorage,
};
use std::sync::Arc;
use tempfile::TempDir;

const DIST_BODY: &str =
    "(`id` UInt64, `value` String) ENGINE = Distributed('cluster', db1, events, rand())";

struct Harness {
    source: Arc<FakeDatabase>,
    target: Arc<FakeDatabase>,
    storage: Arc<FakeStorage>,
    events: Arc<MemorySink>,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            source: Arc::new(FakeDatabase::new()),
            target: Arc::new(FakeDatabase::new()),
            storage: Arc::new(FakeStorage::new()),
            events: Arc::new(MemorySink::new()),
            dir: TempDir::new().unwrap(),
        }
    }

    fn config(&self) -> Config {
        config(&self.dir)
    }

    fn restorer(&self) -> RestoreExecutor {
        RestoreExecutor::new(
            self.target.clone(),
            self.storage.clone(),
            self.config(),
            self.events.clone(),
        )
    }

    async fn backup(&self, name: &str) -> BackupMetadata {
        BackupExecutor::new(
            self.source.clone(),
            self.storage.clone(),
            self.config(),
            self.events.clone(),
        )
        .execute(BackupJob {
            name: Some(name.into()),
            ..Default::default()
        })
        .await
        .unwrap()
    }

    fn journal(&self) -> RestoreContext {
        RestoreContext::open(self.config().backup.restore_context_path).unwrap()
    }
}

fn seed_source(source: &FakeDatabase) {
    let events = merge_tree("db1", "events");
    let parts = vec![
        frozen_part(&events, "all_1_1_0", 100),
        frozen_part(&events, "all_2_2_0", 200),
        frozen_part(&events, "all_3_3_0", 300),
    ];
    source.add_table(events, parts);
    source.add_table(table("db2", "events_dist", "Distributed", DIST_BODY), vec![]);
}

#[tokio::test]
async fn test_restore_into_empty_server() {
    let h = Harness::new();
    seed_source(&h.source);
    h.backup("b1").await;

    let report = h.restorer().restore("b1", &RestoreOptions::default()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.created_tables, vec!["`db1`.`events`", "`db2`.`events_dist`"]);
    assert_eq!(report.attached_parts, 3);
    assert_eq!(h.storage.downloaded_parts().len(), 3);
    assert_eq!(
        h.target.attached(),
        vec!["db1.events:all_1_1_0", "db1.events:all_2_2_0", "db1.events:all_3_3_0"]
    );
    // journal is discarded after a complete run
    assert!(!h.config().backup.restore_context_path.exists());
    assert!(h.events.events().contains(&Event::TableDataRestored {
        database: "db1".into(),
        table: "events".into(),
        restored: 3,
        failed: 0,
    }));
}

#[tokio::test]
async fn test_existing_identical_table_is_kept_and_filled() {
    let h = Harness::new();
    seed_source(&h.source);
    h.backup("b1").await;
    h.target.add_table(merge_tree("db1", "events"), vec![]);

    let report = h.restorer().restore("b1", &RestoreOptions::default()).await.unwrap();

    assert_eq!(report.existing_tables, vec!["`db1`.`events`"]);
    assert_eq!(h.target.created(), vec!["`db2`.`events_dist`"]);
    assert!(h.target.dropped().is_empty());
    assert_eq!(h.target.attached().len(), 3);
}

#[tokio::test]
async fn test_existing_different_table_is_replaced() {
    let h = Harness::new();
    seed_source(&h.source);
    h.backup("b1").await;
    h.target.add_table(
        table("db1", "events", "MergeTree", "(`id` UInt32) ENGINE = MergeTree ORDER BY id"),
        vec![],
    );

    h.restorer().restore("b1", &RestoreOptions::default()).await.unwrap();

    assert_eq!(h.target.dropped(), vec!["`db1`.`events`"]);
    assert_eq!(h.target.created(), vec!["`db1`.`events`", "`db2`.`events_dist`"]);
    assert!(h
        .events
        .events()
        .contains(&Event::TableReplaced { database: "db1".into(), table: "events".into() }));
}

#[tokio::test]
async fn test_resume_after_crash_attaches_only_remaining_parts() {
    let h = Harness::new();
    seed_source(&h.source);
    h.backup("b1").await;

    // state left behind by a run that died after the first attach
    h.target.add_table(merge_tree("db1", "events"), vec![]);
    h.target.add_table(table("db2", "events_dist", "Distributed", DIST_BODY), vec![]);
    std::fs::write(
        h.config().backup.restore_context_path,
        r#"{"db1.events": {"restored": ["all_1_1_0"], "failed": {}}, "disks": {}}"#,
    )
    .unwrap();

    let report = h.restorer().restore("b1", &RestoreOptions::default()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.attached_parts, 2);
    assert_eq!(
        h.target.attached(),
        vec!["db1.events:all_2_2_0", "db1.events:all_3_3_0"]
    );
    assert_eq!(h.storage.downloaded_parts(), vec!["all_2_2_0", "all_3_3_0"]);
}

#[tokio::test]
async fn test_failed_parts_are_reported_and_retried() {
    let h = Harness::new();
    seed_source(&h.source);
    h.backup("b1").await;
    h.target.fail_attach("all_2_2_0");

    let report = h.restorer().restore("b1", &RestoreOptions::default()).await.unwrap();

    assert!(!report.is_complete());
    assert!(report.failed_tables.is_empty());
    assert_eq!(report.failed_parts.len(), 1);
    assert_eq!(report.failed_parts[0].part, "all_2_2_0");
    assert_eq!(report.attached_parts, 2);

    let journal = h.journal();
    assert_eq!(journal.restored_count(), 2);

    h.target.heal();
    h.target.clear_attached();
    let report = h.restorer().restore("b1", &RestoreOptions::default()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(h.target.attached(), vec!["db1.events:all_2_2_0"]);
}

#[tokio::test]
async fn test_restore_order_is_merge_tree_distributed_view() {
    let h = Harness::new();
    h.source.add_table(
        table("db", "v", "View", "AS SELECT * FROM db.d"),
        vec![],
    );
    h.source.add_table(
        table("db", "d", "Distributed", "(`id` UInt64) ENGINE = Distributed('cluster', db, m)"),
        vec![],
    );
    h.source.add_table(merge_tree("db", "m"), vec![]);
    h.target.require("d", "m");
    h.target.require("v", "d");

    let report = h
        .restorer()
        .restore_schema(h.source.as_ref(), &RestoreOptions::default())
        .await
        .unwrap();

    assert_eq!(h.target.created(), vec!["`db`.`m`", "`db`.`d`", "`db`.`v`"]);
    assert!(report.failed_tables.is_empty());
}

#[tokio::test]
async fn test_requeue_resolves_dependencies_within_a_class() {
    let h = Harness::new();
    h.source.add_table(merge_tree("db", "first"), vec![]);
    h.source.add_table(merge_tree("db", "second"), vec![]);
    h.target.require("first", "second");

    h.restorer()
        .restore_schema(h.source.as_ref(), &RestoreOptions::default())
        .await
        .unwrap();

    assert_eq!(h.target.created(), vec!["`db`.`second`", "`db`.`first`"]);
}

#[tokio::test]
async fn test_unsatisfiable_table_terminates_the_loop() {
    let h = Harness::new();
    for name in ["a", "b", "c"] {
        h.source.add_table(merge_tree("db", name), vec![]);
    }
    h.target.require("b", "missing");

    let err = h
        .restorer()
        .restore_schema(h.source.as_ref(), &RestoreOptions::default())
        .await
        .unwrap_err();
    match err {
        BackupError::TablesFailed(tables) => assert_eq!(tables, vec!["`db`.`b`"]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.target.created(), vec!["`db`.`a`", "`db`.`c`"]);

    let not_restored: Vec<Event> = h
        .events
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::TableNotRestored { .. }))
        .collect();
    assert_eq!(not_restored.len(), 1);
    assert!(matches!(
        &not_restored[0],
        Event::TableNotRestored { database, table, error }
            if database == "db" && table == "b" && !error.is_empty()
    ));
}

#[tokio::test]
async fn test_keep_going_returns_failed_tables() {
    let h = Harness::new();
    seed_source(&h.source);
    h.backup("b1").await;
    h.target.fail_create("events");

    let options = RestoreOptions {
        keep_going: true,
        ..Default::default()
    };
    let report = h.restorer().restore("b1", &options).await.unwrap();

    assert_eq!(report.failed_tables, vec!["`db1`.`events`"]);
    assert_eq!(report.created_tables, vec!["`db2`.`events_dist`"]);
    // no data phase for a table that was never created
    assert!(h.target.attached().is_empty());
    assert!(h.storage.downloaded_parts().is_empty());
}

#[tokio::test]
async fn test_schema_only_restore_skips_data() {
    let h = Harness::new();
    seed_source(&h.source);
    h.backup("b1").await;

    let options = RestoreOptions {
        schema_only: true,
        ..Default::default()
    };
    let report = h.restorer().restore("b1", &options).await.unwrap();

    assert_eq!(report.created_tables.len(), 2);
    assert!(h.target.attached().is_empty());
}

#[tokio::test]
async fn test_unfinished_backup_is_not_restorable() {
    let h = Harness::new();
    seed_source(&h.source);
    let backup = h.backup("b1").await;

    let mut document: serde_json::Value =
        serde_json::from_str(&backup.dump_json(false).unwrap()).unwrap();
    document["meta"]["state"] = "creating".into();
    let backup = BackupMetadata::load(document).unwrap();

    let err = h
        .restorer()
        .restore_backup(&backup, &RestoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::NotRestorable { .. }));
}

#[tokio::test]
async fn test_replicated_tables_are_cleaned_before_creation() {
    let h = Harness::new();
    h.source.add_table(
        table(
            "db",
            "events",
            "ReplicatedMergeTree",
            "(`id` UInt64) ENGINE = ReplicatedMergeTree('/clickhouse/tables/{shard}/{database}/{table}', '{replica}') ORDER BY id",
        ),
        vec![],
    );
    h.target.set_macro("shard", "s1");
    h.target.set_macro("replica", "host-1");

    let coordination = Arc::new(FakeCoordination::default());
    let restorer = h.restorer().with_coordination(coordination.clone());
    let options = RestoreOptions {
        clean_zookeeper: true,
        ..Default::default()
    };
    restorer.restore_schema(h.source.as_ref(), &options).await.unwrap();

    assert_eq!(
        coordination.deleted(),
        vec![("/clickhouse/tables/s1/db/events".to_string(), "host-1".to_string())]
    );
    assert_eq!(h.target.created(), vec!["`db`.`events`"]);
}

#[tokio::test]
async fn test_replica_cleanup_without_coordination_is_skipped() {
    let h = Harness::new();
    h.source.add_table(merge_tree("db", "events"), vec![]);

    let options = RestoreOptions {
        clean_zookeeper: true,
        ..Default::default()
    };
    h.restorer().restore_schema(h.source.as_ref(), &options).await.unwrap();

    assert!(h.events.events().contains(&Event::ReplicaCleanupSkipped));
    assert_eq!(h.target.created(), vec!["`db`.`events`"]);
}

#[tokio::test]
async fn test_revision_pinned_disks_restart_once() {
    let h = Harness::new();
    let s3 = Disk::object_storage("s3", "/var/lib/clickhouse/disks/s3", false);
    h.source.add_disk(s3.clone(), Some(7));

    let mut events = merge_tree("db1", "events");
    events.paths_with_disks = vec![("/var/lib/clickhouse/disks/s3/data/db1/events".into(), s3)];
    let mut part = frozen_part(&events, "all_1_1_0", 10);
    part.disk_name = "s3".into();
    h.source.add_table(events, vec![part]);
    h.backup("b1").await;

    h.target.fail_attach("all_1_1_0");
    h.restorer().restore("b1", &RestoreOptions::default()).await.unwrap();
    assert_eq!(h.target.directives(), vec![("s3".to_string(), 7)]);
    assert!(h.storage.downloaded_parts().is_empty());
    assert!(h.journal().disk_restarted("s3"));

    // the resumed run does not restart the disk again
    h.target.heal();
    h.restorer().restore("b1", &RestoreOptions::default()).await.unwrap();
    assert_eq!(h.target.restarted(), vec!["s3"]);
    assert_eq!(h.target.attached(), vec!["db1.events:all_1_1_0"]);
}

#[tokio::test]
async fn test_shadow_backed_disks_copy_parts() {
    let h = Harness::new();
    let s3 = Disk::object_storage("s3", "/var/lib/clickhouse/disks/s3", false);
    h.source.add_disk(s3.clone(), None);
    h.storage.add_shadow_disk("s3");

    let mut events = merge_tree("db1", "events");
    events.paths_with_disks = vec![("/var/lib/clickhouse/disks/s3/data/db1/events".into(), s3)];
    let mut part = frozen_part(&events, "all_1_1_0", 10);
    part.disk_name = "s3".into();
    h.source.add_table(events, vec![part]);
    h.backup("b1").await;

    let report = h.restorer().restore("b1", &RestoreOptions::default()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(h.storage.copied_parts(), vec!["all_1_1_0"]);
    assert!(h.storage.downloaded_parts().is_empty());
    assert!(h.target.directives().is_empty());
}

#[tokio::test]
async fn test_restore_through_retrying_collaborators() {
    let h = Harness::new();
    seed_source(&h.source);
    h.backup("b1").await;

    let target = Arc::new(Retrying::new(FakeDatabase::new(), RetryPolicy::no_retry()));
    let restorer = RestoreExecutor::new(target.clone(), h.storage.clone(), h.config(), h.events.clone());
    let report = restorer.restore("b1", &RestoreOptions::default()).await.unwrap();

    assert_eq!(report.attached_parts, 3);
    assert_eq!(target.inner().attached().len(), 3);
}
