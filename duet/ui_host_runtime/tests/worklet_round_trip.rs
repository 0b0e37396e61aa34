//! Both halves of the worklet runtime talking over one port pair.

use duet_ui_host_runtime::channel::{Endpoint, port_pair};
use duet_ui_host_runtime::worklet::{
    BackgroundWorklets, ClosureValue, JsFnHandle, MainWorklets, Worklet, js_fn,
};
use duet_ui_host_runtime::{RuntimeError, SdkVersion, SdkVersionGate};
use futures::executor::block_on;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;

struct Pair {
    background: BackgroundWorklets,
    background_endpoint: Endpoint,
    main: MainWorklets,
    main_endpoint: Endpoint,
}

impl Pair {
    fn new(main_version: SdkVersion) -> Self {
        let (background_port, main_port) = port_pair();
        let background_endpoint = Endpoint::new(background_port, 16);
        let main_endpoint = Endpoint::new(main_port, 16);
        let background = BackgroundWorklets::new(
            background_endpoint.clone(),
            Rc::new(SdkVersionGate::new(SdkVersion::new(2, 16))),
        );
        let main = MainWorklets::new(main_endpoint.clone(), Rc::new(SdkVersionGate::new(main_version)));
        background.install();
        main.install();
        Self {
            background,
            background_endpoint,
            main,
            main_endpoint,
        }
    }

    /// Delivers everything in flight in both directions.
    fn settle(&self) {
        loop {
            let moved = self.main_endpoint.pump().expect("main pump")
                + self.background_endpoint.pump().expect("background pump");
            if moved == 0 {
                return;
            }
        }
    }
}

fn nested(handle: JsFnHandle) -> ClosureValue {
    ClosureValue::Map(IndexMap::from([(
        "c".to_string(),
        ClosureValue::List(vec![ClosureValue::Plain(json!(0)), handle.into()]),
    )]))
}

#[test]
fn w1_functions_resolve_until_the_main_thread_releases_them() {
    let pair = Pair::new(SdkVersion::new(2, 16));
    let sum = pair.background.transform_to_worklet(js_fn(|params| {
        Ok(json!(params.iter().filter_map(Value::as_i64).sum::<i64>()))
    }));
    let label = pair
        .background
        .transform_to_worklet(js_fn(|_| Ok(json!("nested"))));
    assert_eq!((sum.fn_id, label.fn_id), (1, 2));

    let mut w1 = Worklet::new("W1")
        .capture("a", sum)
        .capture("b", nested(label));
    let exec_id = pair.background.post_worklet_ctx(&mut w1);

    assert_eq!(pair.background.find_js_fn_handle(exec_id, 1).map(|h| h.fn_id), Some(1));
    assert_eq!(pair.background.find_js_fn_handle(exec_id, 2).map(|h| h.fn_id), Some(2));
    assert_eq!(pair.background.find_js_fn_handle(exec_id, 99), None);

    // The main thread holds a decoded copy and calls back into it.
    let mut held = Worklet::from_json(&w1.to_json()).expect("decode worklet");
    assert_eq!(pair.main.retain(&mut held), Some(exec_id));
    let target = held.find_js_fn(1).expect("captured function").clone();
    assert_eq!(target.exec_id, Some(exec_id));

    let pending = pair
        .main
        .run_on_background(&target)
        .expect("gate open")
        .call_with_reply(vec![json!(2), json!(3)])
        .expect("call");
    pair.settle();
    assert_eq!(block_on(pending), Ok(json!(5)));

    let nested_target = held.find_js_fn(2).expect("nested function").clone();
    let pending = pair
        .main
        .run_on_background(&nested_target)
        .expect("gate open")
        .call_with_reply(Vec::new())
        .expect("call");
    pair.settle();
    assert_eq!(block_on(pending), Ok(json!("nested")));

    pair.main.release(&held);
    assert_eq!(pair.main.flush_releases().expect("flush"), Some(vec![exec_id]));
    pair.settle();

    assert_eq!(pair.background.live_exec_ids(), 0);
    assert_eq!(pair.background.find_js_fn_handle(exec_id, 1), None);
    assert_eq!(pair.background.find_js_fn_handle(exec_id, 2), None);
}

#[test]
fn run_on_main_thread_executes_the_registered_body() {
    let pair = Pair::new(SdkVersion::new(2, 16));
    pair.main.register_worklet("W:scale", |worklet, params| {
        let factor = match worklet.captures.get("factor") {
            Some(ClosureValue::Plain(value)) => value.as_i64().unwrap_or(1),
            _ => 1,
        };
        let input = match params.first() {
            Some(ClosureValue::Plain(value)) => value.as_i64().unwrap_or(0),
            _ => 0,
        };
        Ok(json!(factor * input))
    });

    let call = pair
        .background
        .run_on_main_thread(Worklet::new("W:scale").capture("factor", json!(3)))
        .expect("gate open");
    let pending = call.call(vec![json!(7)]).expect("call");
    pair.settle();
    assert_eq!(block_on(pending), Ok(json!(21)));

    // The one-shot context was released after the call returned.
    let exec_id = call.exec_id().expect("posted");
    assert_eq!(pair.main.ref_count(exec_id), 0);
    assert_eq!(pair.main.flush_releases().expect("flush"), Some(vec![exec_id]));
    pair.settle();
    assert_eq!(pair.background.live_exec_ids(), 0);
}

#[test]
fn repeated_main_thread_calls_survive_releases_between_them() {
    let pair = Pair::new(SdkVersion::new(2, 16));
    let replies = Rc::new(RefCell::new(Vec::new()));
    let main = pair.main.clone();
    let sink = replies.clone();
    pair.main.register_worklet("W:callback", move |worklet, _params| {
        let Some(ClosureValue::JsFn(cb)) = worklet.captures.get("cb") else {
            return Err("missing cb".to_string());
        };
        let pending = main
            .run_on_background(cb)
            .map_err(|err| err.to_string())?
            .call_with_reply(Vec::new())
            .map_err(|err| err.to_string())?;
        sink.borrow_mut().push(pending);
        Ok(Value::Null)
    });

    let cb = pair
        .background
        .transform_to_worklet(js_fn(|_| Ok(json!("called"))));
    let call = pair
        .background
        .run_on_main_thread(Worklet::new("W:callback").capture("cb", cb))
        .expect("gate open");

    let first = call.call(Vec::new()).expect("first call");
    pair.settle();
    assert_eq!(block_on(first), Ok(Value::Null));
    let first_exec_id = call.exec_id().expect("posted");
    assert_eq!(pair.main.flush_releases().expect("flush"), Some(vec![first_exec_id]));
    pair.settle();
    assert_eq!(pair.background.live_exec_ids(), 0);

    let second = call.call(Vec::new()).expect("second call");
    pair.settle();
    assert_eq!(block_on(second), Ok(Value::Null));
    assert_eq!(pair.background.live_exec_ids(), 1);

    let results: Vec<_> = replies.borrow_mut().drain(..).map(block_on).collect();
    assert_eq!(results, vec![Ok(json!("called")), Ok(json!("called"))]);
}

#[test]
fn poisoned_handles_fail_when_called_not_when_captured() {
    let pair = Pair::new(SdkVersion::new(2, 16));
    let mut worklet = Worklet::new("W").capture("cb", pair.background.transform_to_worklet(json!(3)));
    pair.background.post_worklet_ctx(&mut worklet);

    let held = Worklet::from_json(&worklet.to_json()).expect("decode worklet");
    let caller = pair
        .main
        .run_on_background(held.find_js_fn(1).expect("captured"))
        .expect("constructing the caller succeeds");

    match caller.call(Vec::new()) {
        Err(RuntimeError::InvalidFunction(message)) => assert_eq!(
            message,
            "Argument of runOnBackground should be a function, but got [number] instead"
        ),
        other => panic!("expected invalid function, got {other:?}"),
    }
}

#[test]
fn old_runtimes_reject_run_on_background_up_front() {
    let pair = Pair::new(SdkVersion::new(2, 15));
    let err = pair
        .main
        .run_on_background(&JsFnHandle::remote(1, Some(1)))
        .err()
        .expect("gate closed");
    assert_eq!(
        err.to_string(),
        "runOnBackground requires runtime version 2.16, but running on 2.15"
    );
}
