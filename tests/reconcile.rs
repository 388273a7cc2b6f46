mod common;

use appmgr::{
    EventType, InternalResult, StatusChange,
    descriptor::AppStatus,
    store::{InstallEvent, PendingState},
};
use common::{Fixture, app_json};
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn test_rescan_without_changes_is_a_no_op() -> InternalResult<()> {
    let fx = Fixture::new();
    fx.write_app(&fx.rom(), "com.example.phone", app_json("com.example.phone", "Phone"));
    fx.write_app(&fx.media(), "com.example.notes", app_json("com.example.notes", "Notes"));
    let engine = fx.engine().await;

    let first = engine.scan().await?;
    assert_eq!(first.diff.added, vec!["com.example.notes", "com.example.phone"]);

    let (mut events, _) = engine.subscribe_events();
    for _ in 0..2 {
        let report = engine.scan().await?;
        assert!(report.diff.is_empty());
        assert!(report.manifests_updated.is_empty());
    }
    let changes: Vec<_> = events
        .drain()
        .into_iter()
        .filter(|e| !matches!(e.event_type, EventType::ScanCompleted))
        .collect();
    assert!(changes.is_empty(), "unexpected events: {:?}", changes);
    Ok(())
}

#[tokio::test]
async fn test_changed_descriptor_updates_record_in_place() -> InternalResult<()> {
    let fx = Fixture::new();
    fx.write_app(&fx.media(), "com.example.notes", app_json("com.example.notes", "Notes"));
    let engine = fx.engine().await;
    engine.scan().await?;

    let mut descriptor = app_json("com.example.notes", "Notes 2");
    descriptor["version"] = json!("1.1.0");
    descriptor["mimeTypes"] = json!([{"mime": "text/markdown", "extension": "md"}]);
    fx.write_app(&fx.media(), "com.example.notes", descriptor);

    let (mut events, _) = engine.subscribe_events();
    let report = engine.scan().await?;
    assert_eq!(report.diff.changed, vec!["com.example.notes"]);

    let app = engine.app("com.example.notes").await.unwrap();
    assert_eq!(app.version, "1.1.0");
    assert_eq!(app.generation, 1);
    assert_eq!(app.default_launch_point().unwrap().title, "Notes 2");
    assert!(!app.execution_locked);
    assert_eq!(
        engine.resolve_resource("md").await.unwrap().active.app_id,
        "com.example.notes"
    );

    let kinds: Vec<_> = events
        .drain()
        .into_iter()
        .map(|e| e.event_type)
        .filter(|t| !matches!(t, EventType::ScanCompleted | EventType::ManifestUpdated { .. }))
        .collect();
    assert_eq!(
        kinds[..3],
        [
            EventType::TerminateRequested {
                app_id: "com.example.notes".to_string()
            },
            EventType::LaunchPointChanged {
                launch_point_id: "com.example.notes_default".to_string(),
                app_id: "com.example.notes".to_string(),
                change: StatusChange::Updated
            },
            EventType::AppChanged {
                app_id: "com.example.notes".to_string(),
                change: StatusChange::Updated
            },
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_deleted_folder_removes_app_and_launch_points() -> InternalResult<()> {
    let fx = Fixture::new();
    let folder = fx.write_app(&fx.media(), "com.example.notes", app_json("com.example.notes", "Notes"));
    let engine = fx.engine().await;
    engine.scan().await?;
    let lp = engine
        .add_launch_point("com.example.notes", Some("Inbox"), None, json!({"view": "inbox"}))
        .await?;
    assert_eq!(lp.id, "com.example.notes_1");

    std::fs::remove_dir_all(folder).unwrap();
    let (mut events, _) = engine.subscribe_events();
    let report = engine.scan().await?;
    assert_eq!(report.diff.removed, vec!["com.example.notes"]);
    assert!(engine.app("com.example.notes").await.is_none());
    assert!(report.packages_removed.contains(&"com.example.notes".to_string()));

    let removed: Vec<_> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e.event_type {
            EventType::LaunchPointChanged {
                launch_point_id,
                change: StatusChange::Removed,
                ..
            } => Some(launch_point_id),
            _ => None,
        })
        .collect();
    assert_eq!(removed, vec!["com.example.notes_default", "com.example.notes_1"]);
    assert!(!fx.config.launch_point_dir.join("com.example.notes_1.json").exists());
    Ok(())
}

#[tokio::test]
async fn test_state_survives_restart() -> InternalResult<()> {
    let fx = Fixture::new();
    fx.write_app(&fx.media(), "com.example.notes", app_json("com.example.notes", "Notes"));
    fx.write_app(&fx.media(), "com.example.mail", app_json("com.example.mail", "Mail"));
    {
        let engine = fx.engine().await;
        engine.scan().await?;
        engine.hide_app("com.example.mail").await?;
        engine
            .add_launch_point("com.example.notes", Some("Drafts"), None, json!({}))
            .await?;
        engine.shutdown().await?;
    }

    let engine = fx.engine().await;
    engine.scan().await?;
    assert!(!engine.app("com.example.mail").await.unwrap().visible);
    let titles: Vec<_> = engine
        .launch_points("com.example.notes")
        .await
        .into_iter()
        .map(|lp| lp.title)
        .collect();
    assert_eq!(titles, vec!["Notes", "Drafts"]);

    engine.unhide_app("com.example.mail").await?;
    assert!(engine.app("com.example.mail").await.unwrap().visible);
    Ok(())
}

#[tokio::test]
async fn test_package_manifest_is_written_once() -> InternalResult<()> {
    let fx = Fixture::new();
    let folder = fx.write_app(&fx.media(), "com.example.notes", app_json("com.example.notes", "Notes"));
    std::fs::write(folder.join("index.html"), vec![b'x'; 5000]).unwrap();
    fx.write_app(&fx.rom(), "com.example.phone", app_json("com.example.phone", "Phone"));
    let engine = fx.engine().await;

    let report = engine.scan().await?;
    assert_eq!(report.manifests_updated, vec!["com.example.notes"]);
    let package = engine.package("com.example.notes").await.unwrap();
    assert!(package.block_size > 0);
    assert!(package.installed_size >= 5000);
    assert_eq!(package.installed_size % package.block_size, 0);
    assert!(fx.config.manifest_dir.join("com.example.notes.json").exists());
    assert!(!fx.config.manifest_dir.join("com.example.phone.json").exists());

    // 再起動してもキャッシュが使われる
    drop(engine);
    let engine = fx.engine().await;
    let report = engine.scan().await?;
    assert!(report.manifests_updated.is_empty());
    assert_eq!(
        engine.package("com.example.notes").await.unwrap().installed_size,
        package.installed_size
    );
    Ok(())
}

#[tokio::test]
async fn test_bad_descriptors_are_reported_not_fatal() -> InternalResult<()> {
    let fx = Fixture::new();
    fx.write_app(&fx.media(), "com.example.ok", app_json("com.example.ok", "Ok"));
    fx.write_app(&fx.media(), "com.example.notitle", json!({"id": "com.example.notitle"}));
    let broken = fx.media().join("applications/com.example.broken");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("appinfo.json"), "{").unwrap();

    let engine = fx.engine().await;
    let (_, mut errors) = engine.subscribe_events();
    let report = engine.scan().await?;
    assert_eq!(report.diff.added, vec!["com.example.ok"]);
    assert_eq!(report.skipped.len(), 2);

    // スキップはエラーチャンネルにも流れる
    let errors = errors.drain();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.error_type == "DescriptorSkipped"));
    assert!(errors.iter().any(|e| e.parameters["path"]
        .as_str()
        .is_some_and(|p| p.ends_with("com.example.broken"))));
    Ok(())
}

#[tokio::test]
async fn test_pending_fresh_install_is_promoted() -> InternalResult<()> {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    engine.scan().await?;

    let pending = engine
        .report_install_status(
            "com.example.new",
            InstallEvent::Started {
                version: "2.0.0".to_string(),
            },
        )
        .await?;
    assert_eq!(pending.state, PendingState::Installing);
    assert_eq!(
        pending.placeholder.as_ref().unwrap().status,
        AppStatus::Installing
    );
    engine
        .report_install_status("com.example.new", InstallEvent::Progress { percent: 60 })
        .await?;
    assert!(engine.app("com.example.new").await.is_none());

    let mut descriptor = app_json("com.example.new", "New");
    descriptor["version"] = json!("2.0.0");
    fx.write_app(&fx.media(), "com.example.new", descriptor);
    let pending = engine
        .report_install_status("com.example.new", InstallEvent::Completed)
        .await?;
    assert_eq!(pending.state, PendingState::Completed);

    let app = engine.app("com.example.new").await.unwrap();
    assert_eq!(app.status, AppStatus::Ready);
    assert_eq!(app.version, "2.0.0");
    assert!(engine.store().read().await.pending_install("com.example.new").is_none());
    Ok(())
}
