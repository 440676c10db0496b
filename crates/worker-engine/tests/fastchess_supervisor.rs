//! End-to-end exercises of the match-runner supervision loop, using a
//! shell script in place of fastchess and a mock coordinator.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use montytest_worker_core::stats::GameStats;
use montytest_worker_engine::coordinator::{TaskReport, TaskState, WorkerInfo};
use montytest_worker_engine::fastchess::{MatchPlan, SPSA_SENTINEL, launch_fastchess};

fn fake_runner(dir: &Path, body: &str) -> PathBuf {
    let script = dir.join("fastchess");
    std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn report_with(stats: GameStats) -> TaskReport {
    TaskReport {
        password: "secret".into(),
        run_id: "64f1e2abc".into(),
        task_id: 7,
        stats,
        worker_info: WorkerInfo {
            username: "tester".into(),
            version: "0.4.0".into(),
            concurrency: 2,
            unique_key: "c0ffee00".into(),
            nps: 182000.0,
        },
        spsa: None,
    }
}

fn plan(games_to_play: u64, batch_size: u64) -> MatchPlan {
    MatchPlan {
        games_to_play,
        batch_size,
        tc_limit: 60.0,
        spsa_tuning: false,
    }
}

async fn mock_update(server: &MockServer, task_alive: bool, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/api/update_task"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "task_alive": task_alive,
            "duration": 0.001,
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn happy_sprt_match_commits_both_batches() {
    let server = MockServer::start().await;
    mock_update(&server, true, 2).await;

    let dir = tempfile::tempdir().unwrap();
    let runner = fake_runner(
        dir.path(),
        concat!(
            "echo 'Started game 1 of 16 (New-e443b2459e1a22b9 vs Base-e443b2459e1a22b9)'\n",
            "echo 'Finished game 3 (monty vs base): 0-1 {White disconnects}' \n",
            "echo 'Finished game 4 (monty vs base): 1-0 {Black loses on time}'\n",
            "echo 'Games: 8, Wins: 3, Losses: 3, Draws: 2, Points: 4.0 (50.00 %)'\n",
            "echo 'Ptnml(0-2): [1, 1, 1, 1, 0], WL/DD Ratio: 1.0'\n",
            "echo 'Games: 16, Wins: 6, Losses: 6, Draws: 4, Points: 8.0 (50.00 %)'\n",
            "echo 'Ptnml(0-2): [2, 2, 2, 2, 0], WL/DD Ratio: 1.0'\n",
            "echo 'Finished match'",
        ),
    );

    // Resumption baseline: 4 games already committed by a previous shift.
    let baseline = GameStats {
        wins: 1,
        losses: 1,
        draws: 2,
        pentanomial: [0, 1, 1, 0, 0],
        ..GameStats::default()
    };
    let mut report = report_with(baseline);
    let mut state = TaskState::default();

    let cmd = vec![
        runner.display().to_string(),
        SPSA_SENTINEL.to_string(),
        SPSA_SENTINEL.to_string(),
    ];
    let alive = launch_fastchess(
        &reqwest::Client::new(),
        &server.uri(),
        dir.path(),
        cmd,
        &mut report,
        &plan(16, 8),
        &mut state,
    )
    .await
    .unwrap();

    assert!(alive);
    assert_eq!(report.stats.wins, 7);
    assert_eq!(report.stats.losses, 7);
    assert_eq!(report.stats.draws, 6);
    assert_eq!(report.stats.pentanomial, [2, 3, 3, 2, 0]);
    assert!(report.stats.is_consistent());
    assert_eq!(report.stats.crashes, 1);
    assert_eq!(report.stats.time_losses, 1);
    assert!(state.last_updated.is_some());
}

#[tokio::test]
async fn cancellation_mid_match_returns_cooperatively() {
    let server = MockServer::start().await;
    mock_update(&server, false, 1).await;

    let dir = tempfile::tempdir().unwrap();
    let runner = fake_runner(
        dir.path(),
        concat!(
            "echo 'Games: 8, Wins: 3, Losses: 3, Draws: 2, Points: 4.0 (50.00 %)'\n",
            "echo 'Ptnml(0-2): [1, 1, 1, 1, 0], WL/DD Ratio: 1.0'\n",
            // The runner would keep playing; the worker must not wait
            // for it once the coordinator has pulled the plug.
            "exec sleep 60",
        ),
    );

    let mut report = report_with(GameStats::default());
    let mut state = TaskState::default();
    let cmd = vec![
        runner.display().to_string(),
        SPSA_SENTINEL.to_string(),
        SPSA_SENTINEL.to_string(),
    ];

    let alive = launch_fastchess(
        &reqwest::Client::new(),
        &server.uri(),
        dir.path(),
        cmd,
        &mut report,
        &plan(16, 8),
        &mut state,
    )
    .await
    .unwrap();

    assert!(!alive, "a dead task stops the supervisor");
    assert!(state.last_updated.is_none());
}

#[tokio::test]
async fn unclean_finish_is_an_error() {
    let server = MockServer::start().await;

    let dir = tempfile::tempdir().unwrap();
    let runner = fake_runner(dir.path(), "echo 'Finished match'");

    let mut report = report_with(GameStats::default());
    let mut state = TaskState::default();
    let cmd = vec![
        runner.display().to_string(),
        SPSA_SENTINEL.to_string(),
        SPSA_SENTINEL.to_string(),
    ];

    let err = launch_fastchess(
        &reqwest::Client::new(),
        &server.uri(),
        dir.path(),
        cmd,
        &mut report,
        &plan(16, 8),
        &mut state,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("uncleanly"), "{err}");
}

#[tokio::test]
async fn option_warnings_fail_the_match() {
    let server = MockServer::start().await;

    let dir = tempfile::tempdir().unwrap();
    let runner = fake_runner(
        dir.path(),
        "echo \"Warning: New-abc123 doesn't have option ThreatBySafePawn\"",
    );

    let mut report = report_with(GameStats::default());
    let mut state = TaskState::default();
    let cmd = vec![
        runner.display().to_string(),
        SPSA_SENTINEL.to_string(),
        SPSA_SENTINEL.to_string(),
    ];

    let err = launch_fastchess(
        &reqwest::Client::new(),
        &server.uri(),
        dir.path(),
        cmd,
        &mut report,
        &plan(16, 8),
        &mut state,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("fastchess says"), "{err}");
}

#[tokio::test]
async fn deadline_overrun_is_an_error() {
    let server = MockServer::start().await;

    let dir = tempfile::tempdir().unwrap();
    let runner = fake_runner(dir.path(), "exec sleep 60");

    let mut report = report_with(GameStats::default());
    let mut state = TaskState::default();
    let cmd = vec![
        runner.display().to_string(),
        SPSA_SENTINEL.to_string(),
        SPSA_SENTINEL.to_string(),
    ];
    let mut expired = plan(16, 8);
    expired.tc_limit = 0.0;

    let err = launch_fastchess(
        &reqwest::Client::new(),
        &server.uri(),
        dir.path(),
        cmd,
        &mut report,
        &expired,
        &mut state,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("past end time"), "{err}");
}

#[tokio::test]
async fn spsa_round_trip_splices_rounded_params_into_the_command() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/request_spsa"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "task_alive": true,
            "w_params": [{"name": "P", "value": 3.4}],
            "b_params": [],
            "duration": 0.001,
        })))
        .expect(1)
        .mount(&server)
        .await;
    mock_update(&server, true, 1).await;

    let dir = tempfile::tempdir().unwrap();
    // Record the arguments so the splice can be checked from outside.
    let runner = fake_runner(
        dir.path(),
        concat!(
            "echo \"$@\" > args.txt\n",
            "echo 'Games: 8, Wins: 3, Losses: 3, Draws: 2, Points: 4.0 (50.00 %)'\n",
            "echo 'Ptnml(0-2): [1, 1, 1, 1, 0], WL/DD Ratio: 1.0'\n",
            "echo 'Finished match'",
        ),
    );

    let mut report = report_with(GameStats::default());
    let mut state = TaskState::default();
    let cmd = vec![
        runner.display().to_string(),
        "-engine".to_string(),
        SPSA_SENTINEL.to_string(),
        "-engine".to_string(),
        SPSA_SENTINEL.to_string(),
    ];

    let spsa_plan = MatchPlan {
        games_to_play: 8,
        batch_size: 8,
        tc_limit: 60.0,
        spsa_tuning: true,
    };
    let alive = launch_fastchess(
        &reqwest::Client::new(),
        &server.uri(),
        dir.path(),
        cmd,
        &mut report,
        &spsa_plan,
        &mut state,
    )
    .await
    .unwrap();

    assert!(alive);
    let args = std::fs::read_to_string(dir.path().join("args.txt")).unwrap();
    assert!(
        args.contains("option.P=3") || args.contains("option.P=4"),
        "spliced args: {args}"
    );

    let spsa = report.spsa.expect("spsa block attached to the report");
    assert_eq!(spsa.num_games, 8);
    assert_eq!((spsa.wins, spsa.losses, spsa.draws), (3, 3, 2));
}

#[tokio::test]
async fn spsa_cancellation_skips_the_match() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/request_spsa"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "task_alive": false,
            "duration": 0.001,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    // Deliberately not executable: the child must never be spawned.
    let runner = dir.path().join("fastchess");
    std::fs::write(&runner, "#!/bin/sh\nexit 1\n").unwrap();

    let mut report = report_with(GameStats::default());
    let mut state = TaskState::default();
    let cmd = vec![
        runner.display().to_string(),
        SPSA_SENTINEL.to_string(),
        SPSA_SENTINEL.to_string(),
    ];

    let spsa_plan = MatchPlan {
        games_to_play: 8,
        batch_size: 8,
        tc_limit: 60.0,
        spsa_tuning: true,
    };
    let alive = launch_fastchess(
        &reqwest::Client::new(),
        &server.uri(),
        dir.path(),
        cmd,
        &mut report,
        &spsa_plan,
        &mut state,
    )
    .await
    .unwrap();
    assert!(!alive);
}
