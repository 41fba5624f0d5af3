//! Module loading through the blocking require bridge.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};

use confine::{Env, Error, Globals, Isolate, IsolateOptions};

use crate::common::{self, FakeEngine, GuestCtl, Program, log_capture, path_in, write_tree};

#[tokio::test]
async fn entry_requires_execute_with_console_output() {
    common::init_tracing();
    let tree = write_tree(&[
        ("main.js", "console.log('start')\nrequire('./lib/a.js')\n"),
        ("lib/a.js", "console.log('from a')\n"),
    ]);
    let program = Program::new()
        .on("main.js", |ctl: &mut GuestCtl<'_>, _source: &str| {
            ctl.log("start")?;
            ctl.require("./lib/a.js")?;
            Ok(())
        })
        .on("lib/a.js", |ctl: &mut GuestCtl<'_>, _source: &str| {
            ctl.log("from a")
        });
    let (logs, console) = log_capture();
    let globals = Globals::new().bridge("console.log", console).unwrap();
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js")).globals(globals),
    )
    .unwrap();

    isolate.run().await.unwrap();
    assert_eq!(*logs.lock(), vec!["start".to_string(), "from a".to_string()]);
}

#[tokio::test]
async fn repeated_require_returns_the_same_module() {
    let tree = write_tree(&[
        ("main.js", "require('./dep.js')\nrequire('./dep.js')\n"),
        ("dep.js", ""),
    ]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let program = Program::new().on("main.js", move |ctl: &mut GuestCtl<'_>, _source: &str| {
        let first = ctl.require_module("./dep.js")?;
        let second = ctl.require_module("./dep.js")?;
        record.lock().push((first, second));
        Ok(())
    });
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js")),
    )
    .unwrap();

    isolate.run().await.unwrap();
    let (first, second) = seen.lock()[0];
    assert_eq!(first, second, "one cached module object per filename");
}

#[tokio::test]
async fn unsupported_builtins_yield_inert_empty_exports() {
    let tree = write_tree(&[("main.js", "require('fs')\nrequire('net')\n")]);
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let record = Arc::clone(&seen);
    let program = Program::new().on("main.js", move |ctl: &mut GuestCtl<'_>, _source: &str| {
        record.lock().push(ctl.require("fs")?);
        record.lock().push(ctl.require("net")?);
        Ok(())
    });
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js")),
    )
    .unwrap();

    isolate.run().await.unwrap();
    assert_eq!(*seen.lock(), vec![json!({}), json!({})]);
}

#[tokio::test]
async fn missing_module_surfaces_a_typed_resolution_error() {
    let tree = write_tree(&[("main.js", "require('./nope.js')\n")]);
    // Default behavior: the entry requires what its source names.
    let isolate = Isolate::new(
        FakeEngine::new(Program::new()),
        IsolateOptions::new(tree.path().join("main.js")),
    )
    .unwrap();

    let err = isolate.run().await.unwrap_err();
    match err {
        Error::Resolution { specifier, from, .. } => {
            assert_eq!(specifier, "./nope.js");
            assert_eq!(from, path_in(&tree, "main.js"));
        }
        other => panic!("expected resolution error, got {other}"),
    }
}

#[tokio::test]
async fn require_override_redirects_to_a_host_file() {
    let host = write_tree(&[("helper.js", "console.log('helper ran')\n")]);
    let tree = write_tree(&[("main.js", "require('helper')\n")]);
    let program = Program::new().on("helper.js", |ctl: &mut GuestCtl<'_>, _source: &str| {
        ctl.log("helper ran")
    });
    let (logs, console) = log_capture();
    let globals = Globals::new().bridge("console.log", console).unwrap();
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js"))
            .globals(globals)
            .require_override("helper", host.path().join("helper.js")),
    )
    .unwrap();

    isolate.run().await.unwrap();
    assert_eq!(*logs.lock(), vec!["helper ran".to_string()]);
}

#[tokio::test]
async fn nodejs_env_substitutes_builtin_polyfills() {
    let tree = write_tree(&[("main.js", "const events = require('events')\n")]);
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let record = Arc::clone(&seen);
    let program = Program::new()
        .on("@polyfill:events", |ctl: &mut GuestCtl<'_>, source: &str| {
            assert!(source.contains("EventEmitter"), "embedded polyfill source");
            ctl.set_exports(json!({ "polyfill": "events" }));
            Ok(())
        })
        .on("main.js", move |ctl: &mut GuestCtl<'_>, _source: &str| {
            record.lock().push(ctl.require("events")?);
            Ok(())
        });
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js")).env(Env::NodeJs),
    )
    .unwrap();

    isolate.run().await.unwrap();
    assert_eq!(*seen.lock(), vec![json!({ "polyfill": "events" })]);
}

#[tokio::test]
async fn nodejs_env_polyfills_url_querystring_and_string_decoder() {
    let tree = write_tree(&[(
        "main.js",
        "require('url')\nrequire('querystring')\nrequire('string_decoder')\n",
    )]);
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let record = Arc::clone(&seen);
    let program = Program::new().on("main.js", move |ctl: &mut GuestCtl<'_>, _source: &str| {
        // url itself requires querystring; all three must load, not fall
        // through to the builtin rejection.
        for name in ["url", "querystring", "string_decoder"] {
            ctl.require(name)?;
            record.lock().push(name.to_string());
        }
        Ok(())
    });
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js")).env(Env::NodeJs),
    )
    .unwrap();

    isolate.run().await.unwrap();
    assert_eq!(*seen.lock(), vec!["url", "querystring", "string_decoder"]);
}

#[tokio::test]
async fn circular_requires_observe_in_progress_exports() {
    let tree = write_tree(&[
        ("main.js", "require('./one.js')\n"),
        (
            "one.js",
            "module.exports = { name: 'one' }\nrequire('./two.js')\n",
        ),
        ("two.js", "require('./one.js')\n"),
    ]);
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let record = Arc::clone(&seen);
    let program = Program::new()
        .on("one.js", |ctl: &mut GuestCtl<'_>, _source: &str| {
            ctl.set_exports(json!({ "name": "one" }));
            ctl.require("./two.js")?;
            Ok(())
        })
        .on("two.js", move |ctl: &mut GuestCtl<'_>, _source: &str| {
            // Re-entering the cycle must return the in-progress module, not
            // execute it again or deadlock.
            record.lock().push(ctl.require("./one.js")?);
            Ok(())
        });
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js")),
    )
    .unwrap();

    isolate.run().await.unwrap();
    assert_eq!(*seen.lock(), vec![json!({ "name": "one" })]);
}

#[tokio::test]
async fn json_modules_parse_as_data() {
    let tree = write_tree(&[
        ("main.js", "const cfg = require('./config.json')\n"),
        ("config.json", r#"{ "retries": 3, "name": "svc" }"#),
    ]);
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let record = Arc::clone(&seen);
    let program = Program::new().on("main.js", move |ctl: &mut GuestCtl<'_>, _source: &str| {
        record.lock().push(ctl.require("./config.json")?);
        Ok(())
    });
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js")),
    )
    .unwrap();

    isolate.run().await.unwrap();
    assert_eq!(*seen.lock(), vec![json!({ "retries": 3, "name": "svc" })]);
}

#[tokio::test]
async fn bare_specifiers_resolve_through_node_modules() {
    let tree = write_tree(&[
        ("main.js", "require('dep')\n"),
        (
            "node_modules/dep/package.json",
            r#"{ "main": "lib/entry.js" }"#,
        ),
        ("node_modules/dep/lib/entry.js", "console.log('dep entry')\n"),
    ]);
    let (logs, console) = log_capture();
    let globals = Globals::new().bridge("console.log", console).unwrap();
    let program = Program::new().on("lib/entry.js", |ctl: &mut GuestCtl<'_>, _source: &str| {
        ctl.log("dep entry")
    });
    let isolate = Isolate::new(
        FakeEngine::new(program),
        IsolateOptions::new(tree.path().join("main.js")).globals(globals),
    )
    .unwrap();

    isolate.run().await.unwrap();
    assert_eq!(*logs.lock(), vec!["dep entry".to_string()]);
}
