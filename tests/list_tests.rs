/// List value tests: set laws, name lookup and list expressions evaluated
/// by a runner.
use narrative_runtime::schema::instruction::{BinaryOp, UnaryOp};
use narrative_runtime::{ListError, ListValue, Step, Story, StoryBuilder};

fn story() -> Story {
    let mut b = StoryBuilder::new();
    b.list_origin("animals", &["cat", "dog", "bird"])
        .list_origin("colours", &["white", "red", "black"])
        .list_origin("moods", &["calm", "red"]);
    b.global_list("seen", "animals", &["cat"]);
    b.begin_knot("start")
        .push_var("seen")
        .push_list(&["bird"])
        .binary(BinaryOp::Add)
        .set("seen")
        .push_var("seen")
        .output()
        .newline()
        .push_var("seen")
        .unary(UnaryOp::ListInvert)
        .output()
        .newline()
        .push_var("seen")
        .push_list(&["cat"])
        .binary(BinaryOp::Has)
        .output()
        .newline()
        .push_var("seen")
        .push_int(1)
        .binary(BinaryOp::Add)
        .output()
        .newline()
        .end();
    b.finish().unwrap()
}

#[test]
fn set_laws_hold_over_one_origin() {
    let story = story();
    let lists = story.lists();
    let a = lists.list_of(&["cat", "bird"]).unwrap();
    let b = lists.list_of(&["dog", "bird"]).unwrap();

    assert_eq!(a.union(&b).union(&a), a.union(&b));
    assert!(a.difference(&a).is_empty());
    assert_eq!(a.intersection(&b), lists.list_of(&["bird"]).unwrap());

    let all = lists.all_of_origin("animals").unwrap();
    let members: Vec<bool> = ["cat", "dog", "bird"]
        .iter()
        .map(|name| lists.contains_named(&a, name).unwrap())
        .collect();
    let expected: Vec<bool> = all.iter().map(|flag| a.contains(flag)).collect();
    assert_eq!(members, expected);
    assert_eq!(members, vec![true, false, true]);
}

#[test]
fn equality_ignores_insertion_order() {
    let story = story();
    let lists = story.lists();
    let forward = lists.list_of(&["white", "bird"]).unwrap();
    let backward = lists.list_of(&["bird", "white"]).unwrap();
    assert_eq!(forward, backward);
    assert_ne!(forward, ListValue::new());
}

#[test]
fn ambiguous_names_need_their_origin() {
    let story = story();
    let lists = story.lists();
    assert!(matches!(
        lists.flag_by_name("red"),
        Err(ListError::AmbiguousFlag { .. })
    ));
    assert!(matches!(
        story.flag_by_name("red"),
        Err(ListError::AmbiguousFlag { .. })
    ));

    let flag = story.flag_by_name("colours.red").unwrap();
    assert_eq!(story.flag_name(flag), Some("red"));
    let list = lists.list_of(&["bird", "white", "colours.red"]).unwrap();
    assert_eq!(lists.render(&list), "bird, white, colours.red");
    assert_eq!(
        lists.list_of(&["bird"]).unwrap().union(&list).count(),
        3
    );
}

#[test]
fn min_and_max_follow_declaration_order() {
    let story = story();
    let lists = story.lists();
    let list = lists.list_of(&["bird", "cat"]).unwrap();
    assert_eq!(lists.render(&list.min()), "cat");
    assert_eq!(lists.render(&list.max()), "bird");

    // Across origins a flag's position within its own origin counts.
    let mixed = lists.list_of(&["bird", "white"]).unwrap();
    assert_eq!(lists.render(&mixed.min()), "white");
    assert_eq!(lists.render(&mixed.max()), "bird");
    assert_eq!(lists.value_of(&mixed), 3);

    let tied = lists.list_of(&["white", "cat"]).unwrap();
    assert_eq!(lists.render(&tied.min()), "cat");
    assert_eq!(lists.render(&tied.max()), "cat");
}

#[test]
fn runner_evaluates_list_expressions() {
    let story = story();
    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals).unwrap();

    let mut lines = Vec::new();
    while let Step::Line(line) = runner.advance().unwrap() {
        lines.push(line.text);
    }
    assert_eq!(lines, vec!["cat, bird", "dog", "true", "dog"]);
}
