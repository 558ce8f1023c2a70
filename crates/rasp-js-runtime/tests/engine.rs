use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rasp_js_runtime::{
    AlarmRecord, AlarmSink, Engine, EngineConfig, IsolateSlot, LogSink, Outcome, RequestContext,
    Sinks, Worker, TIMEOUT_MESSAGE,
};
use serde_json::json;
use tempfile::TempDir;

#[derive(Default)]
struct Memory {
    alarms: Mutex<Vec<AlarmRecord>>,
    logs: Mutex<Vec<String>>,
}

impl AlarmSink for Memory {
    fn alarm(&self, record: AlarmRecord) {
        self.alarms.lock().push(record);
    }
}

impl LogSink for Memory {
    fn log(&self, line: &str) {
        self.logs.lock().push(line.to_string());
    }
}

impl Memory {
    fn alarm_count(&self) -> usize {
        self.alarms.lock().len()
    }

    fn logs_containing(&self, needle: &str) -> usize {
        self.logs.lock().iter().filter(|l| l.contains(needle)).count()
    }
}

const DETECTOR: &str = r#"
var plugin = new RASP('detector');

plugin.register('sql', function (params) {
    return [{ action: 'block', name: 'x', message: 'sqli: ' + params.query, confidence: 90 }];
});

plugin.register('ignored', function () {
    return [{ action: 'ignore', message: 'nothing to see' }];
});

plugin.register('mixed', function () {
    return [
        { action: 'log', message: 'logged', confidence: '75' },
        { action: 'quarantine' },
        { message: 'no action' },
        { action: 42 },
        'not an object',
        null,
        { action: 'IGNORE' },
    ];
});

plugin.register('loop', function () {
    while (true) {}
});

plugin.register('throw', function () {
    throw new Error('boom from plugin');
});

plugin.register('stall', function () {
    return [
        { action: 'block' },
        { action: 'log', message: { toString: function () { for (;;) {} } } },
    ];
});

plugin.register('formatted', function () {
    try {
        null.field;
    } catch (e) {
        plugin.log(RASP.formatError(e));
    }
    return [];
});
"#;

fn write_plugin(root: &Path, name: &str, code: &str) {
    let dir = root.join("plugins");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), code).unwrap();
}

fn engine_in(root: &Path, timeout_ms: u64) -> (Engine, Arc<Memory>) {
    let memory = Arc::new(Memory::default());
    let config = EngineConfig::new(root).with_timeout(Duration::from_millis(timeout_ms));
    let sinks = Sinks {
        alarm: memory.clone(),
        log: memory.clone(),
    };
    (Engine::with_sinks(config, sinks).unwrap(), memory)
}

fn detector() -> (TempDir, Engine, Arc<Memory>) {
    let temp = TempDir::new().unwrap();
    write_plugin(temp.path(), "detector.js", DETECTOR);
    let (engine, memory) = engine_in(temp.path(), 100);
    (temp, engine, memory)
}

#[test]
fn test_unreferenced_event_is_allowed() {
    let (_temp, engine, memory) = detector();
    let mut worker = Worker::new(&engine);

    assert!(!worker.check("fileUpload", json!({ "name": "a.php" })));
    assert!(!worker.check("", json!(null)));
    assert_eq!(memory.alarm_count(), 0);
}

#[test]
fn test_block_verdict() {
    let (_temp, engine, memory) = detector();
    let mut worker = Worker::new(&engine);
    let params = Arc::new(json!({ "query": "select 1 union select 2" }));

    assert!(worker.check("sql", Arc::clone(&params)));

    let alarms = memory.alarms.lock();
    assert_eq!(alarms.len(), 1);
    let alarm = &alarms[0];
    assert_eq!(alarm.attack_type, "sql");
    assert_eq!(alarm.intercept_state.raw, "block");
    assert_eq!(alarm.plugin_name, "x");
    assert_eq!(alarm.plugin_message, "sqli: select 1 union select 2");
    assert_eq!(alarm.plugin_confidence, 90);
    assert!(Arc::ptr_eq(&alarm.attack_params, &params));
}

#[test]
fn test_ignore_verdict() {
    let (_temp, engine, memory) = detector();
    let mut worker = Worker::new(&engine);

    assert!(!worker.check("ignored", json!({})));
    assert_eq!(memory.alarm_count(), 0);
}

#[test]
fn test_mixed_verdicts() {
    let (_temp, engine, memory) = detector();
    let mut worker = Worker::new(&engine);
    let params = Arc::new(json!({ "cmd": "ls" }));

    let outcome = worker.check_outcome("mixed", Arc::clone(&params)).unwrap();
    assert_eq!(
        outcome,
        Outcome::Verdicts {
            alarms: 3,
            blocked: false
        }
    );

    let alarms = memory.alarms.lock();
    let states: Vec<_> = alarms.iter().map(|a| a.intercept_state.raw.as_str()).collect();
    assert_eq!(states, vec!["log", "quarantine", "IGNORE"]);
    assert_eq!(alarms[0].plugin_message, "logged");
    assert_eq!(alarms[0].plugin_confidence, 75);
    // The dispatcher fills in the registering plugin's name.
    assert_eq!(alarms[1].plugin_name, "detector");
    assert_eq!(alarms[1].plugin_message, "");
    assert_eq!(alarms[1].plugin_confidence, 0);
    assert!(alarms.iter().all(|a| Arc::ptr_eq(&a.attack_params, &params)));
}

#[test]
fn test_runaway_plugin_times_out() {
    let (_temp, engine, memory) = detector();
    let mut worker = Worker::new(&engine);
    assert!(worker.initialize());

    let start = Instant::now();
    let outcome = worker.check_outcome("loop", json!({ "n": 1 })).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, Outcome::TimedOut);
    assert!(elapsed >= Duration::from_millis(100), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1100), "took {:?}", elapsed);
    assert_eq!(memory.alarm_count(), 0);
    assert_eq!(memory.logs_containing(TIMEOUT_MESSAGE), 1);

    let notice: serde_json::Value = {
        let logs = memory.logs.lock();
        let line = logs.iter().find(|l| l.contains(TIMEOUT_MESSAGE)).unwrap();
        serde_json::from_str(line).unwrap()
    };
    assert_eq!(notice["type"], "loop");
    assert_eq!(notice["params"]["n"], 1);
    assert!(notice["context"].is_object());

    // The same isolate keeps working.
    assert!(worker.is_ready());
    assert!(worker.check("sql", json!({ "query": "x" })));
    assert!(!worker.check("ignored", json!({})));
}

#[test]
fn test_timeout_can_discard_isolate() {
    let temp = TempDir::new().unwrap();
    write_plugin(temp.path(), "detector.js", DETECTOR);
    let memory = Arc::new(Memory::default());
    let config = EngineConfig::new(temp.path())
        .with_timeout(Duration::from_millis(50))
        .with_rebuild_on_timeout(true);
    let engine = Engine::with_alarm_and_log(config, memory.clone(), memory.clone()).unwrap();
    let mut worker = Worker::new(&engine);

    assert!(!worker.check("loop", json!({})));
    assert!(!worker.is_ready());
    assert!(worker.check("sql", json!({ "query": "x" })));
    assert!(worker.is_ready());
}

#[test]
fn test_timeout_while_reading_verdicts_discards_them() {
    let (_temp, engine, memory) = detector();
    let mut worker = Worker::new(&engine);

    let outcome = worker.check_outcome("stall", json!({})).unwrap();

    assert_eq!(outcome, Outcome::TimedOut);
    assert!(!outcome.is_blocked());
    assert_eq!(memory.alarm_count(), 0);
    assert_eq!(memory.logs_containing(TIMEOUT_MESSAGE), 1);

    assert!(worker.check("sql", json!({ "query": "x" })));
    assert_eq!(memory.alarm_count(), 1);
}

#[test]
fn test_plugins_can_format_errors() {
    let (_temp, engine, memory) = detector();
    let mut worker = Worker::new(&engine);

    assert!(!worker.check("formatted", json!({})));
    let logs = memory.logs.lock();
    let line = logs.iter().find(|l| l.starts_with("[detector]")).unwrap();
    assert!(line.contains("TypeError"), "{}", line);
}

#[test]
fn test_thrown_error_is_contained() {
    let (_temp, engine, memory) = detector();
    let mut worker = Worker::new(&engine);

    let outcome = worker.check_outcome("throw", json!({})).unwrap();
    match outcome {
        Outcome::Threw(detail) => assert!(detail.contains("boom from plugin"), "{}", detail),
        other => panic!("expected Threw, got {:?}", other),
    }
    assert_eq!(memory.alarm_count(), 0);
    assert_eq!(memory.logs_containing("boom from plugin"), 1);
    assert_eq!(memory.logs_containing(TIMEOUT_MESSAGE), 0);

    assert!(worker.check("sql", json!({ "query": "x" })));
}

#[test]
fn test_plugin_load_failure_is_not_fatal() {
    let temp = TempDir::new().unwrap();
    write_plugin(
        temp.path(),
        "a_broken.js",
        "new RASP('early').register('early', () => [{ action: 'block' }]);\nthrow new Error('load failure');\nnew RASP('late').register('late', () => [{ action: 'block' }]);",
    );
    write_plugin(temp.path(), "b_detector.js", DETECTOR);
    write_plugin(temp.path(), "c_syntax.js", "this is not javascript");
    let (engine, memory) = engine_in(temp.path(), 100);

    assert!(engine.is_enabled());
    let status = engine.status();
    assert_eq!(status.discovered, vec!["a_broken.js", "b_detector.js", "c_syntax.js"]);
    assert_eq!(status.loaded, vec!["b_detector.js"]);
    assert_eq!(memory.logs_containing("load failure"), 1);

    let mut worker = Worker::new(&engine);
    assert!(worker.check("early", json!({})));
    assert!(!worker.check("late", json!({})));
    assert!(worker.check("sql", json!({ "query": "x" })));
}

#[test]
fn test_plugin_scope_is_isolated() {
    let temp = TempDir::new().unwrap();
    write_plugin(temp.path(), "a.js", "var shared = 1; globalThis.exported = 'a';");
    write_plugin(temp.path(), "b.js", "var shared = 2; const again = 3;");
    let (engine, _memory) = engine_in(temp.path(), 100);

    let mut worker = Worker::new(&engine);
    let isolate = worker.isolate().unwrap();
    let names = isolate.global_names().unwrap();
    assert!(names.contains(&"exported".to_string()));
    assert!(!names.contains(&"shared".to_string()));
    assert!(!names.contains(&"again".to_string()));
    assert_eq!(isolate.eval("RASP.plugins().length === 0").unwrap(), json!(true));
}

#[test]
fn test_rebuild_yields_identical_globals() {
    let temp = TempDir::new().unwrap();
    write_plugin(temp.path(), "detector.js", DETECTOR);
    write_plugin(temp.path(), "globals.js", "globalThis.helper = function () {};");

    let (first, _) = engine_in(temp.path(), 100);
    let (second, _) = engine_in(temp.path(), 100);

    let names = |engine: &Engine| {
        let mut worker = Worker::new(engine);
        worker.isolate().unwrap().global_names().unwrap()
    };
    let a = names(&first);
    let b = names(&second);
    assert_eq!(a, b);
    assert!(a.contains(&"RASP".to_string()));
    assert!(a.contains(&"helper".to_string()));

    assert!(first.reload());
    assert_eq!(names(&first), a);
}

#[test]
fn test_size_cap() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("plugins");
    fs::create_dir_all(&dir).unwrap();

    let pad = |head: &str, size: usize| {
        let mut code = head.to_string();
        code.push_str(&" ".repeat(size - head.len()));
        code
    };
    fs::write(dir.join("plugin.JS"), pad("globalThis.fromUpper = true;\n", 5 * 1024 * 1024)).unwrap();
    fs::write(dir.join("plugin.js"), pad("globalThis.fromLower = true;\n", 11 * 1024 * 1024)).unwrap();

    let (engine, _memory) = engine_in(temp.path(), 100);
    assert_eq!(engine.plugins(), vec!["plugin.JS"]);

    let mut worker = Worker::new(&engine);
    let names = worker.isolate().unwrap().global_names().unwrap();
    assert!(names.contains(&"fromUpper".to_string()));
    assert!(!names.contains(&"fromLower".to_string()));
}

#[test]
fn test_no_plugins_disables_checks() {
    let temp = TempDir::new().unwrap();
    let (engine, memory) = engine_in(temp.path(), 100);

    assert!(!engine.is_enabled());
    let mut worker = Worker::new(&engine);
    assert!(!worker.initialize());
    assert!(matches!(worker.slot(), IsolateSlot::Disabled { generation: 0 }));
    assert!(!worker.check("sql", json!({})));
    assert!(worker.check_outcome("sql", json!({})).is_none());
    assert_eq!(memory.alarm_count(), 0);

    // Teardown of a never-initialized worker is harmless.
    let mut fresh = Worker::new(&engine);
    fresh.teardown();
    fresh.teardown();
}

#[test]
fn test_reload_picks_up_new_plugins() {
    let temp = TempDir::new().unwrap();
    write_plugin(temp.path(), "a.js", "new RASP('a').register('ssrf', () => [{ action: 'log' }]);");
    let (engine, _memory) = engine_in(temp.path(), 100);
    let mut worker = Worker::new(&engine);

    assert!(!worker.check("ssrf", json!({})));
    assert_eq!(engine.generation(), 0);

    write_plugin(temp.path(), "b.js", "new RASP('b').register('ssrf', () => [{ action: 'block' }]);");
    assert!(engine.reload());
    assert_eq!(engine.generation(), 1);
    assert_eq!(engine.plugins(), vec!["a.js", "b.js"]);

    assert!(worker.check("ssrf", json!({})));
}

#[test]
fn test_request_context_reaches_plugins() {
    let temp = TempDir::new().unwrap();
    write_plugin(
        temp.path(),
        "ctx.js",
        r#"new RASP('ctx').register('request', function (params, context) {
            if (context.remoteAddr === '10.0.0.1' && context.header['x-evil'] === '1') {
                return [{ action: 'block', message: context.method + ' ' + context.url }];
            }
            return [];
        });"#,
    );
    let (engine, memory) = engine_in(temp.path(), 100);
    let mut worker = Worker::new(&engine);

    assert!(!worker.check("request", json!({})));

    let mut header = serde_json::Map::new();
    header.insert("x-evil".into(), json!("1"));
    worker.set_request(RequestContext {
        url: Some("http://example.com/a".into()),
        method: Some("POST".into()),
        remote_addr: Some("10.0.0.1".into()),
        header,
        ..Default::default()
    });
    assert!(worker.check("request", json!({})));
    assert_eq!(memory.alarms.lock()[0].plugin_message, "POST http://example.com/a");

    worker.set_request(RequestContext::default());
    assert!(!worker.check("request", json!({})));
}

#[test]
fn test_native_bridge_from_plugins() {
    let temp = TempDir::new().unwrap();
    write_plugin(
        temp.path(),
        "sql.js",
        r#"var p = new RASP('sql');
        console.log('loaded', 1, { ok: true });
        p.register('sql', function (params) {
            var tokens = RASP.sql_tokenize(params.query);
            p.log('tokens', tokens.length);
            var lowered = tokens.map(function (t) { return t.toLowerCase(); });
            if (lowered.indexOf('union') !== -1) {
                return [{ action: 'block', message: tokens.join('|') }];
            }
            return [];
        });"#,
    );
    let (engine, memory) = engine_in(temp.path(), 100);
    assert_eq!(memory.logs_containing(r#"loaded 1 {"ok":true}"#), 1);

    let mut worker = Worker::new(&engine);
    assert!(!worker.check("sql", json!({ "query": "select * from t where id = 1" })));
    assert!(worker.check("sql", json!({ "query": "1 UNION SELECT 'a'" })));
    assert_eq!(memory.alarms.lock()[0].plugin_message, "1|UNION|SELECT|'a'");
    assert_eq!(memory.logs_containing("[sql] tokens 4"), 1);
}

#[test]
fn test_workers_do_not_share_state() {
    let temp = TempDir::new().unwrap();
    write_plugin(
        temp.path(),
        "counter.js",
        r#"var count = 0;
        new RASP('counter').register('tick', function () {
            count += 1;
            return count === 2 ? [{ action: 'block' }] : [];
        });"#,
    );
    let (engine, _memory) = engine_in(temp.path(), 1000);

    let results: Vec<Vec<bool>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = engine.clone();
                s.spawn(move || {
                    let mut worker = Worker::new(&engine);
                    (0..3)
                        .map(|_| worker.check("tick", json!({})))
                        .collect::<Vec<bool>>()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results, vec![vec![false, true, false], vec![false, true, false]]);
}

#[test]
fn test_bridge_globals_are_frozen() {
    let (_temp, engine, _memory) = detector();
    let mut worker = Worker::new(&engine);

    {
        let isolate = worker.isolate().unwrap();
        assert_eq!(isolate.eval("Object.isFrozen(__rasp_native)").unwrap(), json!(true));
        assert_eq!(isolate.eval("Object.isFrozen(RASP)").unwrap(), json!(true));
        assert_eq!(
            isolate.eval("typeof __rasp_native.tokenize").unwrap(),
            json!("function")
        );
        // Silently ignored outside strict mode.
        assert_eq!(
            isolate.eval("RASP.check = null; typeof RASP.check").unwrap(),
            json!("function")
        );
    }

    assert!(worker.check("sql", json!({ "query": "x" })));
    assert!(!worker.check("ignored", json!({})));
}
