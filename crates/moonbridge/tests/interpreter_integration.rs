//! Integration tests for host functions, chunks and error propagation

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use moonbridge::{
    CallAdapter, Error, HostObject, HostType, HostValue, Interpreter, Options, ScriptError,
    Signature,
};
use moonbridge_vm::{VmState, MULTRET};
use parking_lot::Mutex;

/// Chunk calling the global `name` with no arguments and returning its results
fn call_global(name: &'static str) -> impl Fn(&VmState) -> moonbridge_vm::VmResult<usize> + Send + Sync {
    move |vm| {
        vm.get_global(name)?;
        vm.call(0, MULTRET)?;
        Ok(vm.get_top() as usize)
    }
}

fn tagged(tag: &'static str, ty: HostType) -> Signature {
    Signature::builder()
        .param(ty)
        .build(move |_, _| Ok(vec![HostValue::String(tag.to_string())]))
}

#[test]
fn test_ping_from_chunk() {
    let lua = Interpreter::new().unwrap();
    lua.register_fn("ping", || "pong").unwrap();
    let out = lua.do_chunk("main", call_global("ping")).unwrap();
    assert_eq!(out, vec![HostValue::String("pong".into())]);
    assert_eq!(lua.state().get_top(), 0);
}

#[test]
fn test_overload_selection_by_argument_type() {
    let lua = Interpreter::new().unwrap();
    lua.register_overloads(
        "f",
        vec![tagged("int", HostType::I32), tagged("string", HostType::String)],
    )
    .unwrap();
    let f = lua.get_function("f").unwrap().unwrap();

    assert_eq!(
        f.call(&[HostValue::Int(5)]).unwrap(),
        vec![HostValue::String("int".into())]
    );
    assert_eq!(
        f.call(&[HostValue::String("x".into())]).unwrap(),
        vec![HostValue::String("string".into())]
    );

    let err = f.call(&[HostValue::Bool(true)]).unwrap_err();
    let script = err.as_script().unwrap();
    assert_eq!(script.message(), "no overload of 'f' accepts (boolean)");
    assert!(matches!(script.cause(), Some(Error::NoMatchingOverload { name, .. }) if name == "f"));
}

#[test]
fn test_multiple_results_keep_order() {
    let lua = Interpreter::new().unwrap();
    lua.register_fn("split", |s: String| {
        let (a, b) = s.split_once(',').unwrap_or((s.as_str(), ""));
        (a.to_string(), b.to_string())
    })
    .unwrap();
    let f = lua.get_function("split").unwrap().unwrap();
    let out = f.call(&[HostValue::String("left,right".into())]).unwrap();
    assert_eq!(
        out,
        vec![HostValue::String("left".into()), HostValue::String("right".into())]
    );
}

#[test]
fn test_variadic_from_vm() {
    let lua = Interpreter::new().unwrap();
    let sum = Signature::builder()
        .variadic(HostType::I64)
        .build(|_, args| {
            let total: i64 = match args.into_iter().next() {
                Some(HostValue::List(items)) => items.iter().filter_map(HostValue::as_i64).sum(),
                _ => 0,
            };
            Ok(vec![HostValue::Int(total)])
        });
    lua.register_overloads("sum", vec![sum]).unwrap();
    let f = lua.get_function("sum").unwrap().unwrap();
    let out = f
        .call(&[HostValue::Int(1), HostValue::Int(2), HostValue::Float(3.0)])
        .unwrap();
    assert_eq!(out, vec![HostValue::Int(6)]);
}

struct Counter {
    hits: AtomicI64,
}

#[test]
fn test_bound_method_sees_target() {
    let lua = Interpreter::new().unwrap();
    let counter = Arc::new(Counter {
        hits: AtomicI64::new(0),
    });
    let add = Signature::builder().param(HostType::I64).build(|ctx, args| {
        let counter = ctx.target_as::<Counter>().ok_or("unbound method")?;
        let n = args[0].as_i64().unwrap_or(0);
        Ok(vec![HostValue::Int(counter.hits.fetch_add(n, Ordering::SeqCst) + n)])
    });
    lua.new_table_at("counter").unwrap();
    lua.register_method("counter.add", HostObject::from_arc(counter.clone()), vec![add])
        .unwrap();

    let f = lua.get_function("counter.add").unwrap().unwrap();
    f.call(&[HostValue::Int(2)]).unwrap();
    let out = f.call(&[HostValue::Int(3)]).unwrap();
    assert_eq!(out, vec![HostValue::Int(5)]);
    assert_eq!(counter.hits.load(Ordering::SeqCst), 5);
}

#[test]
fn test_host_error_caught_by_vm_pcall() {
    let lua = Interpreter::new().unwrap();
    lua.register_fn("fail", || -> Result<(), Error> { Err(Error::runtime("boom")) })
        .unwrap();

    let out = lua
        .do_chunk("main", |vm| {
            vm.get_global("pcall")?;
            vm.get_global("fail")?;
            vm.call(1, MULTRET)?;
            // ok, tostring(err)
            vm.get_global("tostring")?;
            vm.push_copy(2)?;
            vm.call(1, 1)?;
            vm.remove(2);
            Ok(2)
        })
        .unwrap();
    assert_eq!(out, vec![HostValue::Bool(false), HostValue::String("boom".into())]);
}

#[test]
fn test_host_error_surfaces_with_cause() {
    let lua = Interpreter::new().unwrap();
    lua.register_fn("fail", || -> Result<(), Error> { Err(Error::runtime("boom")) })
        .unwrap();
    let err = lua.do_chunk("main", call_global("fail")).unwrap_err();
    let script = err.as_script().unwrap();
    assert_eq!(script.message(), "boom");
    assert!(matches!(script.cause(), Some(Error::Runtime(m)) if m == "boom"));
    assert!(script.traceback().is_none());
}

#[test]
fn test_nested_host_error_is_not_rewrapped() {
    let lua = Interpreter::new().unwrap();
    lua.register_fn("fail", || -> Result<(), Error> { Err(Error::runtime("inner")) })
        .unwrap();
    let fail = lua.get_function("fail").unwrap().unwrap();

    let seen: Arc<Mutex<Option<Arc<ScriptError>>>> = Arc::new(Mutex::new(None));
    let seen_inner = seen.clone();
    lua.register_fn("outer", move || -> Result<(), Error> {
        let err = fail.call(&[]).unwrap_err();
        if let Error::Script(s) = &err {
            *seen_inner.lock() = Some(s.clone());
        }
        Err(err)
    })
    .unwrap();

    let err = lua.do_chunk("main", call_global("outer")).unwrap_err();
    let outer = match err {
        Error::Script(s) => s,
        other => panic!("unexpected {:?}", other),
    };
    let inner = seen.lock().clone().unwrap();
    assert!(Arc::ptr_eq(&outer, &inner));
    assert_eq!(outer.message(), "inner");
}

#[test]
fn test_script_error_with_traceback() {
    let lua = Interpreter::with_options(Options::default().with_traceback(true)).unwrap();
    let err = lua
        .do_chunk("main", |vm| {
            vm.get_global("error")?;
            vm.push_string("bad")?;
            vm.call(1, 0)?;
            Ok(0)
        })
        .unwrap_err();
    let script = err.as_script().unwrap();
    assert_eq!(script.message(), "bad");
    assert!(script.traceback().unwrap().starts_with("stack traceback:"));
}

#[test]
fn test_script_error_keeps_payload() {
    let lua = Interpreter::new().unwrap();
    let err = lua
        .do_chunk("main", |vm| {
            vm.get_global("error")?;
            vm.push_integer(42)?;
            vm.call(1, 0)?;
            Ok(0)
        })
        .unwrap_err();
    let script = err.as_script().unwrap();
    assert_eq!(script.message(), "42");
    assert_eq!(script.payload(), &HostValue::Int(42));
}

#[test]
fn test_panic_becomes_script_error() {
    let lua = Interpreter::new().unwrap();
    lua.register_fn("explode", || -> i32 { panic!("kaboom") }).unwrap();
    let err = lua.do_chunk("main", call_global("explode")).unwrap_err();
    assert_eq!(
        err.as_script().unwrap().message(),
        "host function 'explode' panicked: kaboom"
    );

    // the interpreter stays usable
    lua.register_fn("ping", || "pong").unwrap();
    assert_eq!(
        lua.do_chunk("main", call_global("ping")).unwrap(),
        vec![HostValue::String("pong".into())]
    );
}

#[test]
fn test_function_passed_back_into_vm() {
    let lua = Interpreter::new().unwrap();
    let double = lua.create_function(CallAdapter::from_fn("double", |x: i64| x * 2));
    lua.set("double", double.clone()).unwrap();

    let apply = lua.get_function("double").unwrap().unwrap();
    assert_eq!(apply.call(&[HostValue::Int(4)]).unwrap(), vec![HostValue::Int(8)]);
    // calling the unpushed native directly goes through the same adapter
    assert_eq!(double.call(&[HostValue::Int(5)]).unwrap(), vec![HostValue::Int(10)]);
}

#[test]
fn test_call_function_with_return_types() {
    let lua = Interpreter::new().unwrap();
    lua.register_fn("half", |x: i64| x as f64 / 2.0).unwrap();
    let f = lua.get_function("half").unwrap().unwrap();
    let out = lua
        .call_function(&f, &[HostValue::Int(4)], Some(&[HostType::I32]))
        .unwrap();
    assert_eq!(out, vec![HostValue::Int(2)]);

    let err = lua
        .call_function(&f, &[HostValue::Int(3)], Some(&[HostType::I32]))
        .unwrap_err();
    assert!(matches!(err, Error::Coercion { .. }));
}

#[test]
fn test_call_on_closed_interpreter() {
    let lua = Interpreter::new().unwrap();
    lua.register_fn("ping", || "pong").unwrap();
    let f = lua.get_function("ping").unwrap().unwrap();
    lua.close();
    assert!(f.call(&[]).unwrap().is_empty());
    assert!(matches!(lua.call_function(&f, &[], None), Err(Error::Closed)));
    assert!(matches!(lua.load_chunk("x", |_| Ok(0)), Err(Error::Closed)));
}

#[test]
fn test_thread_shares_translator() {
    let lua = Interpreter::new().unwrap();
    lua.register_fn("ping", || "pong").unwrap();
    let thread = lua.new_thread().unwrap();
    let f = lua.get_function("ping").unwrap().unwrap();
    assert_eq!(
        thread.call(&f, &[]).unwrap(),
        vec![HostValue::String("pong".into())]
    );
}

#[test]
fn test_userdata_with_metatable() {
    let lua = Interpreter::new().unwrap();
    let ud = lua.new_userdata(String::from("payload"), true).unwrap();
    assert_eq!(ud.with_payload(|s: &String| s.clone()), Some("payload".to_string()));
    let mt = ud.metatable().unwrap().unwrap();
    let index = lua.new_table().unwrap();
    index.set("kind", "demo").unwrap();
    mt.set("__index", index).unwrap();
    assert_eq!(ud.get("kind").unwrap(), HostValue::String("demo".into()));
}

#[test]
fn test_debug_traceback_outside_calls() {
    let lua = Interpreter::new().unwrap();
    assert!(lua.debug_traceback().unwrap().starts_with("stack traceback:"));
    lua.close();
    assert!(matches!(lua.debug_traceback(), Err(Error::Closed)));
}
