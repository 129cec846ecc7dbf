//! Integration tests for table proxies and reference lifecycle

use moonbridge::{Error, HostValue, Interpreter, Number, Options, TableRef};
use moonbridge_vm::VmState;

fn s(v: &str) -> HostValue {
    HostValue::String(v.to_string())
}

#[test]
fn test_insert_remove_scenario() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    t.insert("a").unwrap();
    t.insert("b").unwrap();
    t.insert("c").unwrap();
    assert_eq!(t.len(), 3);

    assert_eq!(t.remove().unwrap(), s("c"));
    assert_eq!(t.len(), 2);
    assert_eq!(t.to_list().unwrap(), vec![s("a"), s("b")]);
}

#[test]
fn test_positional_insert_and_remove() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    for v in [1, 3] {
        t.insert(v).unwrap();
    }
    t.insert_at(2, 2).unwrap();
    assert_eq!(
        t.to_list().unwrap(),
        vec![HostValue::Int(1), HostValue::Int(2), HostValue::Int(3)]
    );
    assert_eq!(t.remove_at(1).unwrap(), HostValue::Int(1));
    assert_eq!(t.to_list().unwrap(), vec![HostValue::Int(2), HostValue::Int(3)]);
}

#[test]
fn test_set_then_get_scalar_and_alias() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    t.set("k", 5).unwrap();
    assert_eq!(t.get("k").unwrap(), HostValue::Int(5));
    t.set(1, 2.5).unwrap();
    assert_eq!(t.get(1).unwrap(), HostValue::Float(2.5));

    let inner = lua.new_table().unwrap();
    t.set("inner", inner.clone()).unwrap();
    let alias = match t.get("inner").unwrap() {
        HostValue::Table(a) => a,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(alias, inner);
    assert_ne!(alias.reference().slot(), inner.reference().slot());

    // mutations are shared
    alias.set("x", true).unwrap();
    assert_eq!(inner.get("x").unwrap(), HostValue::Bool(true));
}

#[test]
fn test_dispose_twice_and_after_reuse() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    let slot = t.reference().slot();
    t.dispose();
    t.dispose();
    assert!(!t.is_available());

    let other = lua.new_table().unwrap();
    assert_eq!(other.reference().slot(), slot);
    other.set("alive", 1).unwrap();

    t.dispose();
    assert_eq!(other.get("alive").unwrap(), HostValue::Int(1));
    assert_eq!(t.get("alive").unwrap(), HostValue::Nil);
}

#[test]
fn test_dropped_proxy_released_at_next_operation() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    drop(t);
    assert_eq!(lua.translator().pending_releases(), 1);
    lua.get("anything").unwrap();
    assert_eq!(lua.translator().pending_releases(), 0);
}

#[test]
fn test_proxy_dropped_on_another_thread() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    t.set("k", 1).unwrap();
    std::thread::spawn(move || drop(t)).join().unwrap();

    assert_eq!(lua.translator().pending_releases(), 1);
    lua.get("anything").unwrap();
    assert_eq!(lua.translator().pending_releases(), 0);
}

#[test]
fn test_failed_marshal_leaves_stack_unchanged() {
    let lua = Interpreter::with_options(Options::default().with_max_stack(8)).unwrap();
    let mut nested = HostValue::Int(1);
    for _ in 0..10 {
        nested = HostValue::List(vec![nested]);
    }
    let err = lua.marshal(&nested).unwrap_err();
    assert!(matches!(err, Error::StackOverflow { .. }));
    assert_eq!(lua.state().get_top(), 0);

    let bad_key = HostValue::Map(vec![(HostValue::Nil, HostValue::Int(1))]);
    let err = lua.push(&bad_key).unwrap_err();
    assert!(matches!(err, Error::Coercion { .. }));
    assert_eq!(lua.state().get_top(), 0);

    // a valid map still goes through
    lua.push(&HostValue::Map(vec![(HostValue::String("a".into()), HostValue::Int(1))]))
        .unwrap();
    assert_eq!(lua.state().get_top(), 1);
}

#[test]
fn test_closed_vm_gives_neutral_results() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    t.insert(1).unwrap();
    lua.close();

    assert!(!t.is_available());
    assert_eq!(t.get(1).unwrap(), HostValue::Nil);
    assert_eq!(t.raw_get(1).unwrap(), HostValue::Nil);
    assert!(t.set(1, 2).is_ok());
    assert!(t.insert(3).is_ok());
    assert_eq!(t.remove().unwrap(), HostValue::Nil);
    assert_eq!(t.len(), 0);
    assert!(t.to_list().unwrap().is_empty());
    assert!(t.pairs().unwrap().is_empty());
    assert!(t.to_map().unwrap().is_empty());
    assert_eq!(t.concat(",", None, None).unwrap(), "");
    assert!(t.unpack(None, None).unwrap().is_empty());
    assert_eq!(t.find(1, None).unwrap(), None);
    assert!(t.metatable().unwrap().is_none());
    assert_eq!(t.to_display_string(), "table");
    t.dispose();
    drop(t);
    assert_eq!(lua.translator().pending_releases(), 0);
}

#[test]
fn test_raw_access_bypasses_metatable() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    let mt = lua.new_table().unwrap();
    let defaults = lua.new_table().unwrap();
    defaults.set("color", "red").unwrap();
    mt.set("__index", defaults).unwrap();
    t.set_metatable(Some(&mt)).unwrap();

    assert_eq!(t.get("color").unwrap(), s("red"));
    assert_eq!(t.raw_get("color").unwrap(), HostValue::Nil);
    assert_eq!(t.metatable().unwrap(), Some(mt));

    t.set_metatable(None).unwrap();
    assert_eq!(t.get("color").unwrap(), HostValue::Nil);
}

#[test]
fn test_clear_keeps_metatable() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    let mt = lua.new_table().unwrap();
    let defaults = lua.new_table().unwrap();
    defaults.set("color", "red").unwrap();
    mt.set("__index", defaults).unwrap();
    t.set_metatable(Some(&mt)).unwrap();
    t.set("color", "blue").unwrap();
    t.insert(1).unwrap();

    t.clear().unwrap();
    assert!(t.pairs().unwrap().is_empty());
    assert_eq!(t.get("color").unwrap(), s("red"));
    assert_eq!(t.metatable().unwrap(), Some(mt));
}

#[test]
fn test_to_map_merges_colliding_keys() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    t.set(1, "number").unwrap();
    t.set("1", "string").unwrap();
    let map = t.to_map().unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(map["1"], s("string"));
}

#[test]
fn test_library_operations() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    for v in [3, 1, 2] {
        t.insert(v).unwrap();
    }
    t.sort().unwrap();
    assert_eq!(t.concat(",", None, None).unwrap(), "1,2,3");
    assert_eq!(t.concat("-", Some(2), Some(3)).unwrap(), "2-3");

    let desc = lua.create_function(moonbridge::CallAdapter::from_fn("desc", |a: i64, b: i64| a > b));
    t.sort_by(&desc).unwrap();
    assert_eq!(t.concat(",", None, None).unwrap(), "3,2,1");

    assert_eq!(
        t.unpack(Some(2), None).unwrap(),
        vec![HostValue::Int(2), HostValue::Int(1)]
    );

    let dest = lua.new_table().unwrap();
    t.move_range(1, 3, 2, Some(&dest)).unwrap();
    assert_eq!(dest.get(1).unwrap(), HostValue::Nil);
    assert_eq!(dest.get(4).unwrap(), HostValue::Int(1));
    assert_eq!(t.find(2, None).unwrap(), Some(2));
    assert_eq!(t.find(3, Some(2)).unwrap(), None);
}

#[test]
fn test_sort_error_surfaces() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    t.insert(1).unwrap();
    t.insert("x").unwrap();
    let err = t.sort().unwrap_err();
    assert!(matches!(err, Error::Script(_)));
    assert_eq!(lua.state().get_top(), 0);
}

#[test]
fn test_snapshots() {
    let lua = Interpreter::new().unwrap();
    let t = lua.new_table().unwrap();
    t.set("b", 2).unwrap();
    t.set("a", 1).unwrap();
    t.set(10, "ten").unwrap();
    t.set(lua.new_table().unwrap(), "skipped in maps").unwrap();

    assert_eq!(t.pairs().unwrap().len(), 4);
    let map = t.to_map().unwrap();
    assert_eq!(map.len(), 3);
    assert_eq!(map["a"], HostValue::Int(1));
    assert_eq!(map["10"], s("ten"));

    let mut count = 0;
    t.foreach(|_, _| {
        count += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(count, 4);

    t.clear().unwrap();
    assert!(t.pairs().unwrap().is_empty());
}

#[test]
fn test_foreachi_visits_array_part() {
    let lua = Interpreter::new().unwrap();
    let t = lua.pack(vec![s("x"), s("y")]).unwrap();
    let mut seen = Vec::new();
    t.foreachi(|i, v| {
        seen.push((i, v.clone()));
        Ok(())
    })
    .unwrap();
    assert_eq!(seen, vec![(1, s("x")), (2, s("y"))]);
}

#[test]
fn test_paths_on_tables() {
    let lua = Interpreter::new().unwrap();
    let root = lua.new_table().unwrap();
    root.set("child", lua.new_table().unwrap()).unwrap();
    root.set_path("child.value", 7).unwrap();
    assert_eq!(root.get_path("child.value").unwrap(), HostValue::Int(7));
    assert_eq!(root.get_path("missing.value").unwrap(), HostValue::Nil);
    root.set_path("missing.value", 1).unwrap();
    assert_eq!(root.get("missing").unwrap(), HostValue::Nil);
}

#[test]
fn test_list_argument_reaches_vm_as_table() {
    let lua = Interpreter::new().unwrap();
    lua.register_fn("count", |t: TableRef| t.len() as i64).unwrap();
    let f = lua.get_function("count").unwrap().unwrap();
    let out = f
        .call(&[HostValue::List(vec![HostValue::Int(1), HostValue::Int(2)])])
        .unwrap();
    assert_eq!(out, vec![HostValue::Int(2)]);
}

#[test]
fn test_table_built_by_chunk() {
    let lua = Interpreter::new().unwrap();
    let out = lua
        .do_chunk("main", |vm: &VmState| {
            vm.create_table(2, 0)?;
            vm.push_integer(10)?;
            vm.raw_set_i(-2, 1)?;
            vm.push_number(0.5)?;
            vm.raw_set_i(-2, 2)?;
            Ok(1)
        })
        .unwrap();
    let t = out[0].as_table().unwrap();
    let values: Vec<Number> = t
        .to_list()
        .unwrap()
        .into_iter()
        .map(|v| v.into_typed::<Number>().unwrap())
        .collect();
    assert!(values[0].is_integer());
    assert!(!values[1].is_integer());
    assert_eq!(values[0].clone() + values[1].clone(), 10.5);
}
