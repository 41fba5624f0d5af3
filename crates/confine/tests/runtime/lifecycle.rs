//! Isolate lifecycle: open, run, guest exit, close.

use serde_json::json;

use confine::{Env, Error, Globals, Isolate, IsolateOptions, LifecycleState};

use crate::common::{FakeEngine, GuestCtl, Program, log_capture, write_tree};

#[tokio::test]
async fn guest_exit_ends_the_run_cleanly_and_closes() {
    let tree = write_tree(&[(
        "main.js",
        "console.log('one')\nprocess.exit(1)\nconsole.log('two')\n",
    )]);
    let program = Program::new().on("main.js", |ctl: &mut GuestCtl<'_>, _source: &str| {
        ctl.log("one")?;
        ctl.process_exit(1)?;
        ctl.log("two")
    });
    let (logs, console) = log_capture();
    let globals = Globals::new().bridge("console.log", console).unwrap();
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js"))
            .env(Env::NodeJs)
            .globals(globals),
    )
    .unwrap();

    isolate.run().await.unwrap();

    assert_eq!(*logs.lock(), vec!["one".to_string()]);
    assert_eq!(isolate.exit_code(), Some(1));
    assert_eq!(isolate.state(), LifecycleState::Disposed);
    assert_eq!(isolate.wait_closed().await, 1);

    // The isolate is closed; its API is gone.
    let err = isolate
        .handle_api_call("anything", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MethodNotFound(_)));
}

#[tokio::test]
async fn close_is_idempotent_and_wakes_waiters() {
    let tree = write_tree(&[("main.js", "")]);
    let isolate = Isolate::new(
        FakeEngine::new(Program::new()),
        IsolateOptions::new(tree.path().join("main.js")),
    )
    .unwrap();
    isolate.run().await.unwrap();

    isolate.close();
    isolate.close();
    assert_eq!(isolate.state(), LifecycleState::Disposed);
    assert_eq!(isolate.wait_closed().await, 0);
    assert_eq!(isolate.wait_closed().await, 0, "waiting stays satisfied");
}

#[tokio::test]
async fn init_opens_ahead_of_run() {
    let tree = write_tree(&[("main.js", "")]);
    let isolate = Isolate::new(
        FakeEngine::new(Program::new()),
        IsolateOptions::new(tree.path().join("main.js")),
    )
    .unwrap();

    isolate.init().await.unwrap();
    assert_eq!(isolate.state(), LifecycleState::Open);
    isolate.init().await.unwrap();
    assert_eq!(isolate.state(), LifecycleState::Open);

    isolate.run().await.unwrap();
    assert_eq!(isolate.state(), LifecycleState::Closed);
}

#[tokio::test]
async fn inline_source_skips_the_disk_read() {
    let tree = write_tree(&[("real.js", "")]);
    // No file exists at the entry path; the inline source stands in for it
    // while resolution still runs against its directory.
    let isolate = Isolate::new(
        FakeEngine::new(Program::new()),
        IsolateOptions::new(tree.path().join("ghost.js")).source("require('./real.js')\n"),
    )
    .unwrap();

    isolate.run().await.unwrap();
    assert_eq!(isolate.state(), LifecycleState::Closed);
}

#[tokio::test]
async fn run_is_single_shot() {
    let tree = write_tree(&[("main.js", "")]);
    let isolate = Isolate::new(
        FakeEngine::new(Program::new()),
        IsolateOptions::new(tree.path().join("main.js")),
    )
    .unwrap();

    assert_eq!(isolate.state(), LifecycleState::Idle);
    isolate.run().await.unwrap();
    assert_eq!(isolate.state(), LifecycleState::Closed);
    assert_eq!(isolate.exit_code(), None);

    let err = isolate.run().await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn run_after_close_is_rejected() {
    let tree = write_tree(&[("main.js", "")]);
    let isolate = Isolate::new(
        FakeEngine::new(Program::new()),
        IsolateOptions::new(tree.path().join("main.js")),
    )
    .unwrap();

    isolate.close();
    let err = isolate.run().await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn entry_exceptions_surface_as_execution_errors() {
    let tree = write_tree(&[("main.js", "throw new Error('boom')\n")]);
    let program = Program::new().on("main.js", |_ctl: &mut GuestCtl<'_>, _source: &str| {
        Err(crate::common::Abort::Exception("boom".to_string()))
    });
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js")),
    )
    .unwrap();

    let err = isolate.run().await.unwrap_err();
    match err {
        Error::Execution(message) => assert_eq!(message, "boom"),
        other => panic!("expected execution error, got {other}"),
    }
    assert_eq!(isolate.state(), LifecycleState::Closed);
}

#[tokio::test]
async fn exports_survive_a_finished_run() {
    let tree = write_tree(&[("main.js", "exports.ping = () => 'pong'\n")]);
    let program = Program::new().on("main.js", |ctl: &mut GuestCtl<'_>, _source: &str| {
        ctl.export_fn("ping", |_args| Ok(json!("pong")));
        Ok(())
    });
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js")),
    )
    .unwrap();
    isolate.run().await.unwrap();

    // Calls remain valid after the entry finished, until close.
    let pong = isolate.handle_api_call("ping", Vec::new()).await.unwrap();
    assert_eq!(pong, json!("pong"));
    isolate.close();
}
