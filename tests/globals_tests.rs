/// Globals store tests: typed access, coercion, observers and what runners
/// write into the store.
use narrative_runtime::{GlobalsError, Step, Story, StoryBuilder, Value, ValueKind};
use std::cell::RefCell;
use std::rc::Rc;

fn story() -> Story {
    let mut b = StoryBuilder::new();
    b.list_origin("items", &["rope", "lamp", "key"]);
    b.global("score", 0)
        .global("speed", 1.5f32)
        .global("name", "Ash")
        .global_list("pack", "items", &["rope"]);
    b.begin_knot("start")
        .line("A")
        .push_int(5)
        .set("score")
        .line("B")
        .end();
    b.finish().unwrap()
}

#[test]
fn get_and_set_declared_variables() {
    let story = story();
    let globals = story.new_globals();

    assert_eq!(globals.get("score").unwrap(), Value::Int(0));
    assert_eq!(globals.get_as::<String>("name").unwrap(), "Ash");
    globals.set("score", 12).unwrap();
    assert_eq!(globals.get_as::<i32>("score").unwrap(), 12);

    assert_eq!(
        globals.get("health"),
        Err(GlobalsError::UndeclaredVariable("health".to_string()))
    );
    assert_eq!(
        globals.set("health", 1),
        Err(GlobalsError::UndeclaredVariable("health".to_string()))
    );
}

#[test]
fn set_coerces_like_expressions() {
    let story = story();
    let globals = story.new_globals();

    globals.set("speed", 3).unwrap();
    assert_eq!(globals.get("speed").unwrap(), Value::Float(3.0));

    assert_eq!(
        globals.set("score", "lots"),
        Err(GlobalsError::TypeMismatch {
            name: "score".to_string(),
            expected: ValueKind::Int,
            found: ValueKind::String,
        })
    );

    let lamp = story.lists().list_of(&["lamp", "key"]).unwrap();
    globals.set("pack", lamp.clone()).unwrap();
    assert_eq!(globals.get("pack").unwrap(), Value::List(lamp));
    assert!(matches!(
        globals.set("score", story.lists().list_of(&["key"]).unwrap()),
        Err(GlobalsError::TypeMismatch { .. })
    ));
    assert_eq!(globals.get("score").unwrap(), Value::Int(0));
}

#[test]
fn observers_run_in_order_after_the_commit() {
    let story = story();
    let globals = story.new_globals();
    let log = Rc::new(RefCell::new(Vec::new()));

    for name in ["first", "second"] {
        let log = log.clone();
        let reader = globals.clone();
        globals
            .observe("score", move |old, new| {
                let visible = reader.get("score").unwrap();
                log.borrow_mut()
                    .push(format!("{name}: {old:?} -> {new:?} (sees {visible:?})"));
            })
            .unwrap();
    }

    globals.set("score", 7).unwrap();
    assert_eq!(
        *log.borrow(),
        vec![
            "first: Int(0) -> Int(7) (sees Int(7))".to_string(),
            "second: Int(0) -> Int(7) (sees Int(7))".to_string(),
        ]
    );

    // An unchanged value is not a change.
    globals.set("score", 7).unwrap();
    assert_eq!(log.borrow().len(), 2);
}

#[test]
fn story_assignments_notify_once_the_line_is_settled() {
    let story = story();
    let globals = story.new_globals();
    let changes = Rc::new(RefCell::new(Vec::new()));
    let sink = changes.clone();
    globals
        .observe("score", move |old, new| {
            sink.borrow_mut().push((old.clone(), new.clone()));
        })
        .unwrap();

    let mut runner = story.new_runner(&globals).unwrap();
    assert!(matches!(runner.advance().unwrap(), Step::Line(l) if l.text == "A"));
    // The assignment after "A" has not been made for real yet.
    assert!(changes.borrow().is_empty());
    assert_eq!(globals.get("score").unwrap(), Value::Int(0));

    assert!(matches!(runner.advance().unwrap(), Step::Line(l) if l.text == "B"));
    assert_eq!(*changes.borrow(), vec![(Value::Int(0), Value::Int(5))]);
    assert_eq!(globals.get("score").unwrap(), Value::Int(5));
}

#[test]
fn observing_an_undeclared_variable_fails() {
    let story = story();
    let globals = story.new_globals();
    assert!(matches!(
        globals.observe("mana", |_, _| {}),
        Err(GlobalsError::UndeclaredVariable(_))
    ));
    assert!(matches!(
        globals.visit_count("nowhere"),
        Err(GlobalsError::UnknownPath(_))
    ));
}
