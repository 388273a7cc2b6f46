mod common;

use std::{collections::BTreeMap, time::Duration};

use appmgr::{
    Engine, Error, InternalResult,
    config::HapticsBackend,
    event::relay::RelayError,
    executor::{CapacityShortfall, InstallRequest, OperationStatus},
    routing::{HandlerRegistration, RoutingError},
};
use common::{Fixture, app_json};
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn test_capacity_on_one_filesystem() -> InternalResult<()> {
    let fx = Fixture::new();
    let engine = fx.engine().await;

    let report = engine.query_install_capacity(None, 1, 1).await?;
    assert!(report.is_sufficient());
    assert_eq!(report.space_needed_kb, 0);

    // downloads と media は同じ tempdir 上にある
    let huge = u64::MAX / 4;
    let report = engine.query_install_capacity(None, huge, huge).await?;
    assert_eq!(report.shortfall, CapacityShortfall::all());
    assert!(report.space_needed_kb > 0);
    Ok(())
}

#[tokio::test]
async fn test_chained_ticket_reaches_upstream() -> InternalResult<()> {
    let fx = Fixture::new();
    fx.install_tool("echo 'status: installing'");
    let engine = fx.engine().await;

    let upstream = engine.new_ticket();
    let mut upstream_rx = engine.subscribe_ticket(upstream)?;
    let downstream = engine.new_ticket();
    engine.chain_tickets(downstream, upstream)?;
    assert!(matches!(
        engine.chain_tickets(upstream, downstream),
        Err(Error::Relay(RelayError::ChainCycle { .. }))
    ));

    engine
        .install_with_ticket(
            InstallRequest {
                target: fx.base().join("downloads/x.ipk"),
                uncompressed_size_kb: 0,
                verify: false,
                system: false,
            },
            downstream,
        )
        .await?;

    // 上流の購読者には下流のチケット番号で届く
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(status) = upstream_rx.recv().await {
            assert_eq!(status.ticket, downstream);
            let done = status.is_terminal();
            seen.push(status.status);
            if done {
                break;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seen.first(), Some(&OperationStatus::Queued));
    assert_eq!(seen.last(), Some(&OperationStatus::Success));
    Ok(())
}

#[tokio::test]
async fn test_unissued_ticket_is_rejected() {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    assert!(matches!(
        engine.subscribe_ticket(9999),
        Err(Error::Relay(RelayError::UnknownTicket(9999)))
    ));
}

#[tokio::test]
async fn test_haptics_backend_follows_config() -> InternalResult<()> {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    let vibrator = engine.vibrator();
    assert_eq!(vibrator.backend(), HapticsBackend::None);
    vibrator.vibrate_named("tap").await?;
    assert!(vibrator.vibrate_named("earthquake").await.is_err());
    drop(engine);

    let mut fx = Fixture::new();
    let enable = fx.base().join("enable");
    std::fs::write(&enable, "0").unwrap();
    fx.config.haptics.backend = HapticsBackend::Auto;
    fx.config.haptics.sysfs_path = enable.clone();
    let engine = fx.engine().await;
    let vibrator = engine.vibrator();
    assert_eq!(vibrator.backend(), HapticsBackend::Sysfs);
    vibrator.vibrate_named("alert").await?;
    assert_eq!(std::fs::read_to_string(&enable).unwrap(), "500");

    engine.shutdown().await?;
    assert_eq!(std::fs::read_to_string(&enable).unwrap(), "0");
    Ok(())
}

#[tokio::test]
async fn test_handler_management_errors() -> InternalResult<()> {
    let fx = Fixture::new();
    let mut viewer = app_json("com.example.viewer", "Viewer");
    viewer["mimeTypes"] = json!([{"mime": "image/png", "verbs": {"view": "1"}}]);
    fx.write_app(&fx.media(), "com.example.viewer", viewer);
    let engine: Engine = fx.engine().await;
    engine.scan().await?;

    let listed = engine.list_handlers("com.example.viewer").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, "image/png");
    assert!(listed[0].primary);

    assert_eq!(
        engine.resolve_by_verb("image/png", "view").await.unwrap().app_id,
        "com.example.viewer"
    );

    let mut verbs = BTreeMap::new();
    verbs.insert("edit".to_string(), "1".to_string());
    assert!(matches!(
        engine
            .register_verbs("image/png", "com.example.paint", verbs.clone())
            .await,
        Err(Error::Routing(RoutingError::HandlerNotFound { .. }))
    ));
    assert!(matches!(
        engine.register_verbs("image/gif", "com.example.viewer", verbs.clone()).await,
        Err(Error::Routing(RoutingError::NodeNotFound(_)))
    ));
    engine
        .register_verbs("image/png", "com.example.viewer", verbs)
        .await?;
    assert!(engine.resolve_by_verb("image/png", "view").await.is_none());
    assert!(engine.resolve_by_verb("image/png", "edit").await.is_some());

    assert!(matches!(
        engine
            .add_handler(HandlerRegistration::redirect("*bad", "com.example.viewer"))
            .await,
        Err(Error::Routing(RoutingError::InvalidPattern { .. }))
    ));
    // アプリ由来でないのでシステム既定はない
    assert_eq!(engine.restore_default_handler("image/png").await?, None);

    let freed = engine.remove_handlers_for_app_id("com.example.viewer").await;
    assert_eq!(freed.len(), 1);
    assert!(engine.resolve_resource("image/png").await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_corrupt_routing_table_starts_empty() -> InternalResult<()> {
    let fx = Fixture::new();
    std::fs::write(&fx.config.routing_table_path, "{ not json").unwrap();
    let mut notes = app_json("com.example.notes", "Notes");
    notes["mimeTypes"] = json!([{"mime": "text/plain"}]);
    fx.write_app(&fx.media(), "com.example.notes", notes);

    let engine = fx.engine().await;
    engine.scan().await?;
    assert_eq!(
        engine.resolve_resource("text/plain").await.unwrap().active.app_id,
        "com.example.notes"
    );
    let path = engine.save_routing().await?;
    assert_eq!(path, fx.config.routing_table_path);
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert!(saved["resources"]["text/plain"].is_object());
    Ok(())
}

#[tokio::test]
async fn test_routing_table_with_empty_node_is_discarded() -> InternalResult<()> {
    let fx = Fixture::new();
    std::fs::write(
        &fx.config.routing_table_path,
        json!({
            "nextIndex": 1,
            "freeIndices": [],
            "resources": {"audio/mpa": {"key": "audio/mpa", "kind": "resource", "handlers": []}}
        })
        .to_string(),
    )
    .unwrap();

    let engine = fx.engine().await;
    assert!(engine.resolve_resource("audio/mpa").await.is_none());
    assert!(engine.resolve_resource("mp3").await.is_none());
    assert_eq!(engine.routing().read().await.node_count(), 0);
    Ok(())
}
