mod common;

use std::time::Duration;

use appmgr::{
    Error, ErrorSeverity, InternalResult, Value,
    executor::{ExecutorError, ExitInfo, FailureCode, InstallPhase, InstallRequest, OperationStatus},
};
use common::{Fixture, app_json};
use pretty_assertions::assert_eq;
use serde_json::json;

fn request(fx: &Fixture, file: &str) -> InstallRequest {
    InstallRequest {
        target: fx.base().join("downloads").join(file),
        uncompressed_size_kb: 64,
        verify: false,
        system: false,
    }
}

fn statuses_of(list: &[appmgr::TicketStatus]) -> Vec<OperationStatus> {
    list.iter().map(|s| s.status.clone()).collect()
}

#[tokio::test]
async fn test_install_then_remove() -> InternalResult<()> {
    let fx = Fixture::new();
    fx.install_tool(&fx.unpack_snippet("com.example.notes", "1.0.0"));
    fx.remove_tool("exit 0");
    let engine = fx.engine().await;
    engine.scan().await?;

    // インストール
    let mut receiver = engine
        .install(request(&fx, "com.example.notes_1.0.0_all.ipk"))
        .await?;
    let statuses = receiver.until_terminal().await;
    assert_eq!(
        statuses_of(&statuses),
        vec![
            OperationStatus::Queued,
            OperationStatus::progress(InstallPhase::Unpacking),
            OperationStatus::progress(InstallPhase::Installing),
            OperationStatus::Success,
        ]
    );
    let app = engine.app("com.example.notes").await.unwrap();
    assert_eq!(app.version, "1.0.0");
    assert_eq!(engine.launch_points("com.example.notes").await.len(), 1);

    // 削除
    let marker = fx.base().join("pre-remove-ran");
    std::fs::write(
        app.folder_path.join("pmPreRemove.script"),
        format!("touch {}\n", marker.display()),
    )
    .unwrap();
    let mut receiver = engine.remove("com.example.notes", "user").await?;
    let statuses = receiver.until_terminal().await;
    assert_eq!(
        statuses_of(&statuses),
        vec![
            OperationStatus::Queued,
            OperationStatus::progress(InstallPhase::Removing),
            OperationStatus::Success,
        ]
    );
    assert!(engine.app("com.example.notes").await.is_none());
    assert!(engine.package("com.example.notes").await.is_none());
    assert!(!app.folder_path.exists());
    assert!(marker.exists());

    let runs = fx.tool_runs();
    assert!(runs[0].starts_with("start install"));
    assert!(runs[0].contains("--uncompressed-size 64"));
    assert_eq!(runs.last().unwrap(), "end remove com.example.notes");
    Ok(())
}

#[tokio::test]
async fn test_commands_run_one_at_a_time_in_order() -> InternalResult<()> {
    let fx = Fixture::new();
    fx.install_tool("sleep 0.2");
    let engine = fx.engine().await;

    let mut receivers = Vec::new();
    for name in ["a.ipk", "b.ipk", "c.ipk"] {
        receivers.push(engine.install(request(&fx, name)).await?);
    }
    let snapshot = engine.executor_snapshot().await?;
    assert_eq!(snapshot.queue.len(), 3);
    assert_eq!(snapshot.processing, Some(receivers[0].ticket()));

    for receiver in &mut receivers {
        let statuses = receiver.until_terminal().await;
        assert_eq!(statuses.last().unwrap().status, OperationStatus::Success);
    }

    let names: Vec<String> = fx
        .tool_runs()
        .iter()
        .map(|line| {
            let (edge, rest) = line.split_once(' ').unwrap();
            let file = rest.split_whitespace().nth(1).unwrap();
            let file = std::path::Path::new(file).file_name().unwrap();
            format!("{} {}", edge, file.to_string_lossy())
        })
        .collect();
    assert_eq!(
        names,
        vec![
            "start a.ipk",
            "end a.ipk",
            "start b.ipk",
            "end b.ipk",
            "start c.ipk",
            "end c.ipk"
        ]
    );
    assert_eq!(engine.executor_snapshot().await?.history.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_exit_codes_map_to_failure_codes() -> InternalResult<()> {
    let cases = [
        ("exit 2", FailureCode::InvalidArgs),
        ("exit 5", FailureCode::NotEnoughInstallSpace),
        ("exit 7", FailureCode::PackagefileCorrupt),
        ("exit 9", FailureCode::IpkgInstallFailed),
        ("exit 42", FailureCode::InternalError),
        ("kill -9 $$", FailureCode::InternalError),
    ];
    for (body, expected) in cases {
        let fx = Fixture::new();
        fx.install_tool(body);
        let engine = fx.engine().await;
        let mut receiver = engine.install(request(&fx, "x.ipk")).await?;
        let statuses = receiver.until_terminal().await;
        assert_eq!(
            statuses.last().unwrap().status,
            OperationStatus::Failed(expected),
            "tool body: {}",
            body
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_missing_tool_is_internal_error() -> InternalResult<()> {
    let fx = Fixture::new();
    let engine = fx.engine().await;
    let (_, mut errors) = engine.subscribe_events();
    let mut receiver = engine.install(request(&fx, "x.ipk")).await?;
    let statuses = receiver.until_terminal().await;
    assert_eq!(
        statuses.last().unwrap().status,
        OperationStatus::Failed(FailureCode::InternalError)
    );

    let failure = errors.recv().await?;
    assert_eq!(failure.error_type, "CommandFailed");
    assert_eq!(failure.severity, ErrorSeverity::Error);
    assert_eq!(
        failure.parameters["ticket"],
        Value::from(receiver.ticket() as i64)
    );
    Ok(())
}

#[tokio::test]
async fn test_hung_tool_is_killed() -> InternalResult<()> {
    let mut fx = Fixture::new();
    fx.config.executor.tool_timeout = Duration::from_millis(300);
    fx.install_tool("sleep 5");
    let engine = fx.engine().await;

    let mut receiver = engine.install(request(&fx, "x.ipk")).await?;
    let statuses = tokio::time::timeout(Duration::from_secs(3), receiver.until_terminal())
        .await
        .unwrap();
    assert_eq!(
        statuses.last().unwrap().status,
        OperationStatus::Failed(FailureCode::InternalError)
    );
    Ok(())
}

#[tokio::test]
async fn test_brick_mode_interrupts_and_resumes() -> InternalResult<()> {
    let fx = Fixture::new();
    fx.install_tool("sleep 30");
    let engine = fx.engine().await;

    let mut first = engine.install(request(&fx, "first.ipk")).await?;
    let mut second = engine.install(request(&fx, "second.ipk")).await?;

    // ツールが起動するまで待つ
    let mut started = false;
    for _ in 0..100 {
        if engine.executor_snapshot().await?.pid.is_some() {
            started = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(started);

    let interrupted = engine.enter_brick_mode().await?;
    assert_eq!(interrupted, Some(first.ticket()));

    let refused = engine.install(request(&fx, "third.ipk")).await;
    assert!(matches!(
        refused,
        Err(Error::Executor(ExecutorError::BrickMode))
    ));

    let snapshot = engine.executor_snapshot().await?;
    assert!(snapshot.brick_mode);
    assert_eq!(snapshot.pid, None);
    assert_eq!(snapshot.queue.len(), 2);

    fx.install_tool("exit 0");
    engine.exit_brick_mode().await?;

    // 中断されたコマンドは終端ステータスなしで閉じられる
    let first_statuses = first.until_terminal().await;
    assert!(first_statuses.iter().all(|s| !s.is_terminal()));

    let second_statuses = second.until_terminal().await;
    assert_eq!(
        statuses_of(&second_statuses),
        vec![OperationStatus::Queued, OperationStatus::Success]
    );
    assert_eq!(
        engine.executor_snapshot().await?.interrupted,
        vec![first.ticket()]
    );
    Ok(())
}

#[tokio::test]
async fn test_removal_policy() -> InternalResult<()> {
    let fx = Fixture::new();
    fx.write_app(&fx.rom(), "com.example.clock", app_json("com.example.clock", "Clock"));
    let mut pinned = app_json("com.example.pinned", "Pinned");
    pinned["removable"] = json!(false);
    fx.write_app(&fx.media(), "com.example.pinned", pinned);
    let mut hideable = app_json("com.example.tips", "Tips");
    hideable["removable"] = json!(false);
    hideable["userHideable"] = json!(true);
    fx.write_app(&fx.media(), "com.example.tips", hideable);
    fx.remove_tool("exit 0");

    let engine = fx.engine().await;
    engine.scan().await?;

    // 拒否はキューの先頭で判定され、チケットの失敗になる
    let mut receiver = engine.remove("com.example.pinned", "user").await?;
    assert_eq!(
        statuses_of(&receiver.until_terminal().await),
        vec![
            OperationStatus::Queued,
            OperationStatus::Failed(FailureCode::IpkgRemoveFailed)
        ]
    );
    assert!(engine.app("com.example.pinned").await.unwrap().visible);

    let mut receiver = engine.remove("com.example.tips", "user").await?;
    assert_eq!(
        receiver.until_terminal().await.last().unwrap().status,
        OperationStatus::Success
    );
    assert!(!engine.app("com.example.tips").await.unwrap().visible);

    // 読み取り専用ルートのアプリは hidden リストに入るだけ
    let mut receiver = engine.remove("com.example.clock", "user").await?;
    assert_eq!(
        receiver.until_terminal().await.last().unwrap().status,
        OperationStatus::Success
    );
    assert!(engine.app("com.example.clock").await.is_none());
    assert!(fx.rom().join("applications/com.example.clock").exists());
    engine.scan().await?;
    assert!(engine.app("com.example.clock").await.is_none());

    // 削除ツールは一度も呼ばれていない
    assert!(fx.tool_runs().is_empty());

    let mut receiver = engine.remove("com.example.unknown", "user").await?;
    assert_eq!(
        receiver.until_terminal().await.last().unwrap().status,
        OperationStatus::Failed(FailureCode::InvalidArgs)
    );
    assert!(matches!(
        engine.remove("  ", "user").await,
        Err(Error::Executor(ExecutorError::InvalidRequest(_)))
    ));
    let history = engine.executor_snapshot().await?.history;
    assert_eq!(history.last().unwrap().exit, ExitInfo::NotRun);
    Ok(())
}

#[tokio::test]
async fn test_remove_waits_for_running_install_of_same_package() -> InternalResult<()> {
    let fx = Fixture::new();
    fx.install_tool(&format!(
        "sleep 0.3\n{}",
        fx.unpack_snippet("com.example.pkgx", "1.0.0")
    ));
    fx.remove_tool("exit 0");
    let engine = fx.engine().await;
    engine.scan().await?;

    let mut install = engine
        .install(request(&fx, "com.example.pkgx_1.0.0_all.ipk"))
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    // インストール中でまだ登録されていないパッケージも削除を積める
    assert!(engine.app("com.example.pkgx").await.is_none());
    let mut remove = engine.remove("com.example.pkgx", "user").await?;

    let snapshot = engine.executor_snapshot().await?;
    assert_eq!(snapshot.queue.len(), 2);
    assert_eq!(snapshot.processing, Some(install.ticket()));

    assert_eq!(
        install.until_terminal().await.last().unwrap().status,
        OperationStatus::Success
    );
    assert_eq!(
        statuses_of(&remove.until_terminal().await),
        vec![
            OperationStatus::Queued,
            OperationStatus::progress(InstallPhase::Removing),
            OperationStatus::Success,
        ]
    );

    let edges: Vec<String> = fx
        .tool_runs()
        .iter()
        .map(|line| line.split_whitespace().take(2).collect::<Vec<_>>().join(" "))
        .collect();
    assert_eq!(
        edges,
        vec!["start install", "end install", "start remove", "end remove"]
    );
    assert!(engine.app("com.example.pkgx").await.is_none());
    assert!(engine.package("com.example.pkgx").await.is_none());
    assert!(!fx.media().join("applications/com.example.pkgx").exists());
    Ok(())
}
