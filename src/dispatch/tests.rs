use super::*;

use crate::config::{ExecHostConfig, QueueConfig};
use crate::nanny::tests::RecordingSignaller;
use crate::store::JobRef;
use crate::testutil::{accept, FakePeer, PeerAction, TestDir};

struct Fixture {
    _dir: TestDir,
    svc: Services,
    engine: Arc<DispatchEngine>,
}

fn config(routes: Vec<String>, moms: Vec<String>) -> ServerConfig {
    ServerConfig {
        server_name: "head".into(),
        port: 15001,
        dispatch: DispatchConfig {
            retry_cap: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 20,
            step_timeout_secs: 1,
        },
        exec_hosts: ExecHostConfig {
            moms,
            ..ExecHostConfig::default()
        },
        queues: vec![
            QueueConfig {
                name: "batch".into(),
                ..QueueConfig::default()
            },
            QueueConfig {
                name: "route".into(),
                kind: QueueKind::Routing,
                destinations: routes,
                ..QueueConfig::default()
            },
        ],
        ..ServerConfig::default()
    }
}

fn fixture(name: &str, cfg: ServerConfig) -> Fixture {
    let dir = TestDir::new(name);
    let store = Arc::new(JobStore::open(dir.path(), 1).unwrap());
    let tasks = Arc::new(TaskScheduler::new());
    let registry = ConnectionRegistry::new(
        8,
        "head",
        15001,
        Duration::from_secs(1),
        Duration::from_secs(1),
    );
    let hosts = Arc::new(HostPool::new(
        &cfg.exec_hosts.moms,
        cfg.exec_hosts.mom_port,
        Duration::from_secs(60),
    ));
    let nanny = DeleteNanny::new(
        Arc::clone(&store),
        Arc::clone(&tasks),
        Arc::new(RecordingSignaller::default()),
        Duration::from_secs(60),
        true,
    );
    let svc = Services {
        store,
        queues: Arc::new(QueueManager::new(&cfg.queues)),
        registry,
        tasks,
        hosts,
        nanny,
        notifier: Arc::new(Notifier::new(None, "head")),
    };
    let engine = DispatchEngine::new(svc.clone(), &cfg);
    Fixture {
        _dir: dir,
        svc,
        engine,
    }
}

#[track_caller]
fn submit(f: &Fixture, id: &str, queue: &str) -> JobRef {
    let mut job = Job::new(id);
    job.set_attr(names::JOB_OWNER, "alice@login");
    job.set_attr(names::MAIL_USERS, "alice@example.com");
    job.set_phase(Phase::TRANS_ICM).unwrap();
    f.svc.queues.enqueue(&mut job, queue, Phase::QUEUED).unwrap();
    f.svc.store.write_script(id, 0, b"#!/bin/sh\necho hi\n").unwrap();
    f.svc.store.save(&mut job, SaveMode::Full).unwrap();
    f.svc.store.insert(job).unwrap()
}

fn in_queue(f: &Fixture, queue: &str, id: &str) -> bool {
    queue::lock(&f.svc.queues.find_by_name(queue).unwrap()).contains(id)
}

#[tokio::test]
async fn local_route_is_one_transfer_and_one_quick_save() {
    let cfg = config(vec!["batch".into()], vec![]);
    let f = fixture("dispatch_local_route", cfg);
    let job = submit(&f, "1.head", "route");
    store::lock(&job).destin = Some("stale".into());
    let quick = f.svc.store.stats().quick();

    let outcome = f.engine.route("1.head").await;
    assert_eq!(outcome, Outcome::Success { session_id: None });

    let j = store::lock(&job);
    assert_eq!(j.queue, "batch");
    assert_eq!(j.phase(), Phase::QUEUED);
    assert_eq!(j.destin, None);
    assert!(!in_queue(&f, "route", "1.head"));
    assert_eq!(
        queue::lock(&f.svc.queues.find_by_name("batch").unwrap())
            .jobs()
            .filter(|id| *id == "1.head")
            .count(),
        1
    );
    assert_eq!(f.svc.store.stats().quick(), quick + 1);
}

#[tokio::test]
async fn remote_move_sends_each_step_once_and_purges() {
    let peer = FakePeer::accepting(0).await;
    let cfg = config(vec!["batch".into()], vec![]);
    let f = fixture("dispatch_remote_move", cfg);
    submit(&f, "2.head", "batch");

    let dest = format!("batch@{}", peer.addr());
    f.engine.move_job("2.head", &dest).await.unwrap();

    assert_eq!(
        peer.request_names(),
        vec!["QueueJob", "JobScript", "ReadyToCommit", "Commit"]
    );
    match &peer.requests()[0].1.body {
        RequestBody::QueueJob {
            job_id,
            destination,
            attrs,
        } => {
            assert_eq!(job_id, "2.head");
            assert_eq!(destination, "batch");
            assert!(attrs.iter().any(|a| a.name == names::MAIL_USERS));
        },
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(peer.requests()[0].1.user, "alice");

    assert!(f.svc.store.get("2.head").is_none());
    assert!(!in_queue(&f, "batch", "2.head"));
    assert!(!f.svc.store.files().path("2.head", "JB").exists());

    let pm = f.engine.last_move("2.head").unwrap();
    assert_eq!(pm.sends, 4);
    assert_eq!(pm.attempts, 1);
    assert_eq!(
        pm.phases,
        vec![
            DispatchPhase::Idle,
            DispatchPhase::Connecting,
            DispatchPhase::AwaitQueueAck,
            DispatchPhase::AwaitScriptAck,
            DispatchPhase::AwaitReadyAck,
            DispatchPhase::AwaitCommitAck,
            DispatchPhase::Done,
        ]
    );
}

#[tokio::test]
async fn commit_timeout_keeps_commit_phase_and_resumes_at_ready() {
    let peer = FakePeer::start(|conn, req| match req.body {
        RequestBody::Commit { .. } if conn == 0 => PeerAction::Stall,
        _ => PeerAction::Reply(accept(req, 0)),
    })
    .await;
    let cfg = config(vec!["batch".into()], vec![]);
    let f = fixture("dispatch_commit_timeout", cfg);
    let job = submit(&f, "3.head", "batch");

    let dest = format!("batch@{}", peer.addr());
    assert_eq!(
        f.engine.move_job("3.head", &dest).await,
        Err(ErrorCode::Timeout)
    );
    {
        let j = store::lock(&job);
        assert_eq!(j.phase(), Phase::TRANS_OUT_COMMIT);
        assert_eq!(j.destin.as_deref(), Some(dest.as_str()));
        assert!(!j.deleted);
        assert!(!j.dispatching);
    }
    assert!(in_queue(&f, "batch", "3.head"));
    assert_eq!(f.svc.tasks.pending_labelled("3.head", "resume"), 1);

    let outcome = f.engine.resume("3.head").await;
    assert_eq!(outcome, Outcome::Success { session_id: None });

    let second: Vec<_> = peer
        .requests()
        .into_iter()
        .filter(|(conn, _)| *conn == 1)
        .map(|(_, r)| r.body.name())
        .collect();
    assert_eq!(second, vec!["ReadyToCommit", "Commit"]);
    assert!(f.svc.store.get("3.head").is_none());
    assert_eq!(f.svc.tasks.pending_for_job("3.head"), 0);
}

#[tokio::test]
async fn commit_failures_past_the_retry_cap_keep_the_commit() {
    let peer = FakePeer::start(|conn, req| match req.body {
        RequestBody::Commit { .. } if conn < 3 => PeerAction::Close,
        _ => PeerAction::Reply(accept(req, 0)),
    })
    .await;
    let cfg = config(vec!["batch".into()], vec![]);
    let f = fixture("dispatch_commit_cap", cfg);
    let job = submit(&f, "14.head", "batch");

    let dest = format!("batch@{}", peer.addr());
    assert!(f.engine.move_job("14.head", &dest).await.is_err());
    assert_eq!(
        peer.request_names(),
        vec![
            "QueueJob",
            "JobScript",
            "ReadyToCommit",
            "Commit",
            "ReadyToCommit",
            "Commit",
            "ReadyToCommit",
            "Commit",
        ]
    );
    {
        let j = store::lock(&job);
        assert_eq!(j.phase(), Phase::TRANS_OUT_COMMIT);
        assert_eq!(j.destin.as_deref(), Some(dest.as_str()));
        assert!(!j.dispatching);
    }
    assert_eq!(f.svc.tasks.pending_labelled("14.head", "resume"), 1);

    assert_eq!(
        f.engine.resume("14.head").await,
        Outcome::Success { session_id: None }
    );
    assert!(f.svc.store.get("14.head").is_none());
}

#[tokio::test]
async fn routed_commit_failures_resume_instead_of_rerouting() {
    let peer = FakePeer::start(|_, req| match req.body {
        RequestBody::Commit { .. } => PeerAction::Close,
        _ => PeerAction::Reply(accept(req, 0)),
    })
    .await;
    let routes = vec![format!("batch@{}", peer.addr())];
    let f = fixture("dispatch_route_commit_cap", config(routes, vec![]));
    let job = submit(&f, "15.head", "route");

    let outcome = f.engine.route("15.head").await;
    assert!(matches!(outcome, Outcome::RetryExhausted(_)), "{outcome:?}");

    let j = store::lock(&job);
    assert_eq!(j.phase(), Phase::TRANS_OUT_COMMIT);
    assert!(j.destin.is_some());
    assert!(!j.dispatching);
    assert_eq!(f.svc.tasks.pending_labelled("15.head", "resume"), 1);
    assert_eq!(f.svc.tasks.pending_labelled("15.head", "route"), 0);
}

#[tokio::test]
async fn expired_route_lifetime_aborts_the_job() {
    let mut cfg = config(vec!["batch".into()], vec![]);
    cfg.queues[1].route_lifetime_secs = 10;
    let f = fixture("dispatch_route_expired", cfg);
    let job = submit(&f, "16.head", "route");
    store::lock(&job).queue_time -= 60;

    assert_eq!(
        f.engine.route("16.head").await,
        Outcome::PermanentFail(ErrorCode::RouteExpired)
    );

    let j = store::lock(&job);
    assert_eq!(j.phase(), Phase::COMPLETE);
    assert_eq!(j.attrs.get(names::COMMENT), Some("route lifetime exceeded"));
    assert_eq!(j.attrs.get(names::EXIT_STATUS), Some("-1"));
    assert_eq!(f.svc.tasks.pending_for_job("16.head"), 0);
}

#[tokio::test]
async fn transient_rejections_stop_at_the_retry_cap() {
    let peer = FakePeer::start(|_, req| match req.body {
        RequestBody::QueueJob { .. } => {
            PeerAction::Reply(BatchReply::error(ErrorCode::QueueBusy))
        },
        _ => PeerAction::Reply(accept(req, 0)),
    })
    .await;
    let f = fixture("dispatch_retry_cap", config(vec!["batch".into()], vec![]));
    let job = submit(&f, "4.head", "batch");

    let dest = format!("batch@{}", peer.addr());
    assert_eq!(
        f.engine.move_job("4.head", &dest).await,
        Err(ErrorCode::QueueBusy)
    );
    assert_eq!(peer.request_names(), vec!["QueueJob"; 3]);

    let j = store::lock(&job);
    assert_eq!(j.phase(), Phase::QUEUED);
    assert_eq!(j.destin, None);
    assert!(!j.dispatching);
    assert_eq!(f.engine.last_move("4.head").unwrap().attempts, 3);
}

#[tokio::test]
async fn delete_during_dispatch_abandons_before_commit() {
    let f = fixture("dispatch_abandon", config(vec!["batch".into()], vec![]));
    let store = Arc::clone(&f.svc.store);
    let peer = FakePeer::start(move |_, req| {
        if let RequestBody::ReadyToCommit { job_id } = &req.body {
            if let Some(job) = store.get(job_id) {
                store::lock(&job).deleted = true;
            }
        }
        PeerAction::Reply(accept(req, 0))
    })
    .await;
    submit(&f, "5.head", "batch");

    let dest = format!("batch@{}", peer.addr());
    assert_eq!(
        f.engine.move_job("5.head", &dest).await,
        Err(ErrorCode::UnknownJob)
    );
    assert_eq!(
        peer.request_names(),
        vec!["QueueJob", "JobScript", "ReadyToCommit"]
    );
    assert!(f.svc.store.get("5.head").is_none());
    assert!(!in_queue(&f, "batch", "5.head"));
}

#[tokio::test]
async fn rejected_destination_is_skipped_on_the_next_try() {
    let peer = FakePeer::start(|_, _| {
        PeerAction::Reply(BatchReply::error(ErrorCode::UnknownQueue))
    })
    .await;
    let routes = vec![format!("nope@{}", peer.addr()), "batch".into()];
    let f = fixture("dispatch_reject_next", config(routes, vec![]));
    let job = submit(&f, "6.head", "route");

    let outcome = f.engine.route("6.head").await;
    assert_eq!(outcome, Outcome::Success { session_id: None });
    assert_eq!(peer.request_names(), vec!["QueueJob"]);

    let j = store::lock(&job);
    assert_eq!(j.queue, "batch");
    assert!(j.rejected_dests.is_empty());
}

#[tokio::test]
async fn exhausted_destinations_abort_the_job() {
    let peer = FakePeer::start(|_, _| {
        PeerAction::Reply(BatchReply::error(ErrorCode::UnknownQueue))
    })
    .await;
    let routes = vec![format!("nope@{}", peer.addr())];
    let f = fixture("dispatch_exhausted", config(routes, vec![]));
    let job = submit(&f, "7.head", "route");

    let outcome = f.engine.route("7.head").await;
    assert_eq!(outcome, Outcome::PermanentFail(ErrorCode::RouteReject));

    let j = store::lock(&job);
    assert_eq!(j.phase(), Phase::COMPLETE);
    assert_eq!(j.attrs.get(names::EXIT_STATUS), Some("-1"));
    assert!(j.attrs.get(names::COMMENT).is_some());
    assert_eq!(f.svc.tasks.pending_for_job("7.head"), 0);
}

#[tokio::test]
async fn local_move_into_a_routing_queue_schedules_a_route() {
    let cfg = config(vec!["batch".into()], vec![]);
    let f = fixture("dispatch_local_move", cfg);
    let job = submit(&f, "8.head", "batch");

    f.engine.move_job("8.head", "route").await.unwrap();
    assert_eq!(store::lock(&job).queue, "route");
    assert_eq!(f.svc.tasks.pending_labelled("8.head", "route"), 1);

    assert_eq!(
        f.engine.move_job("8.head", "nowhere").await,
        Err(ErrorCode::UnknownQueue)
    );
}

#[tokio::test]
async fn execution_records_the_session_id() {
    let peer = FakePeer::accepting(4242).await;
    let cfg = config(vec!["batch".into()], vec![peer.addr()]);
    let f = fixture("dispatch_exec", cfg);
    let job = submit(&f, "9.head", "batch");

    assert_eq!(f.engine.execute("9.head", None).await, Ok(Some(4242)));
    assert_eq!(
        peer.request_names(),
        vec!["QueueJob", "JobScript", "ReadyToCommit", "Commit"]
    );
    match &peer.requests()[0].1.body {
        RequestBody::QueueJob { attrs, .. } => {
            assert!(attrs.iter().any(|a| a.name == names::JOB_OWNER));
            assert!(!attrs.iter().any(|a| a.name == names::MAIL_USERS));
        },
        other => panic!("unexpected {other:?}"),
    }

    let j = store::lock(&job);
    assert_eq!(j.phase(), Phase::RUNNING);
    assert_eq!(j.session_id, Some(4242));
    assert_eq!(j.attrs.get(names::SESSION_ID), Some("4242"));
    assert_eq!(j.exec_host.as_deref(), Some(peer.addr().as_str()));
    assert!(j.svrflags.contains(SvrFlags::HAS_RUN));
    assert!(!j.dispatching);
    assert_eq!(
        queue::lock(&f.svc.queues.find_by_name("batch").unwrap())
            .count(crate::types::states::JobState::Running),
        1
    );
}

#[tokio::test]
async fn execution_commit_that_already_happened_is_success() {
    let peer = FakePeer::start(|_, req| match req.body {
        RequestBody::Commit { .. } => {
            PeerAction::Reply(BatchReply::error(ErrorCode::JobExists))
        },
        _ => PeerAction::Reply(accept(req, 0)),
    })
    .await;
    let cfg = config(vec!["batch".into()], vec![peer.addr()]);
    let f = fixture("dispatch_exec_exists", cfg);
    let job = submit(&f, "10.head", "batch");

    assert_eq!(f.engine.execute("10.head", None).await, Ok(None));
    assert_eq!(store::lock(&job).phase(), Phase::RUNNING);
}

#[tokio::test]
async fn execution_timeout_requeues_and_suspects_the_host() {
    let peer = FakePeer::start(|_, _| PeerAction::Stall).await;
    let cfg = config(vec!["batch".into()], vec![peer.addr()]);
    let f = fixture("dispatch_exec_timeout", cfg);
    let job = submit(&f, "11.head", "batch");

    assert_eq!(
        f.engine.execute("11.head", None).await,
        Err(ErrorCode::Timeout)
    );
    {
        let j = store::lock(&job);
        assert_eq!(j.phase(), Phase::QUEUED);
        assert_eq!(j.exec_host, None);
        assert_eq!(j.attrs.get(names::EXEC_HOST), None);
    }
    assert!(f.svc.hosts.is_suspect(&peer.addr()));
    assert_eq!(
        f.engine.execute("11.head", None).await,
        Err(ErrorCode::NoServer)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_start_a_job_once() {
    // Kept under the registry's eight connection slots per round.
    const ROUNDS: usize = 10;
    const JOBS: usize = 4;
    let peer = FakePeer::accepting(7).await;
    let cfg = config(vec!["batch".into()], vec![peer.addr()]);
    let f = fixture("dispatch_exec_race", cfg);

    let mut started = 0;
    for round in 0..ROUNDS {
        let ids: Vec<String> = (0..JOBS)
            .map(|i| format!("{}.head", 100 + round * JOBS + i))
            .collect();
        for id in &ids {
            submit(&f, id, "batch");
        }

        let barrier = Arc::new(tokio::sync::Barrier::new(JOBS * 2));
        let mut runs = Vec::new();
        for id in ids.iter().chain(&ids) {
            let engine = Arc::clone(&f.engine);
            let barrier = Arc::clone(&barrier);
            let id = id.clone();
            runs.push(tokio::spawn(async move {
                barrier.wait().await;
                engine.execute(&id, None).await
            }));
        }
        for run in runs {
            match run.await.unwrap() {
                Ok(_) => started += 1,
                Err(code) => assert_eq!(code, ErrorCode::BadState),
            }
        }
    }

    assert_eq!(started, ROUNDS * JOBS);
    let queued = peer
        .request_names()
        .into_iter()
        .filter(|n| *n == "QueueJob")
        .count();
    assert_eq!(queued, ROUNDS * JOBS);
}

#[tokio::test]
async fn only_queued_jobs_in_execution_queues_run() {
    let cfg = config(vec!["batch".into()], vec!["n1".into()]);
    let f = fixture("dispatch_runnable", cfg);
    submit(&f, "12.head", "route");
    assert_eq!(f.engine.check_runnable("12.head"), Err(ErrorCode::BadState));
    assert_eq!(f.engine.check_runnable("99.head"), Err(ErrorCode::UnknownJob));

    let job = submit(&f, "13.head", "batch");
    {
        let mut j = store::lock(&job);
        f.svc.queues.set_phase(&mut j, Phase::HELD).unwrap();
    }
    assert_eq!(
        f.engine.execute("13.head", None).await,
        Err(ErrorCode::BadState)
    );
}

#[test]
fn destinations_resolve_against_this_server() {
    let f = fixture("dispatch_resolve", config(vec!["batch".into()], vec![]));
    let e = &f.engine;
    assert_eq!(
        e.resolve_destination("batch"),
        Ok(Destination::Local("batch".into()))
    );
    assert_eq!(
        e.resolve_destination("@head"),
        Ok(Destination::Local("batch".into()))
    );
    assert_eq!(
        e.resolve_destination("route@head:15001"),
        Ok(Destination::Local("route".into()))
    );
    assert_eq!(
        e.resolve_destination("work@other"),
        Ok(Destination::Remote {
            queue: "work".into(),
            host: "other".into(),
            port: 15001
        })
    );
    assert_eq!(
        e.resolve_destination("nowhere"),
        Err(ErrorCode::UnknownQueue)
    );
    assert_eq!(e.resolve_destination("q@"), Err(ErrorCode::BadHost));
}
