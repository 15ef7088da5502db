/// Snapshot tests: a restored session must continue exactly like the one it
/// was taken from.
use narrative_runtime::schema::instruction::BinaryOp;
use narrative_runtime::{Snapshot, SnapshotError, Step, Story, StoryBuilder, Value};

/// A short adventure with a random roll, a counter, a tunnel and two
/// choice points.
fn story() -> Story {
    let mut b = StoryBuilder::new();
    b.global("coins", 2);
    b.begin_knot("market")
        .line("The market is loud.")
        .tunnel("haggle")
        .text("You roll ")
        .push_int(1)
        .push_int(6)
        .binary(BinaryOp::Random)
        .output()
        .line(".");
    b.choice("Buy bread", |b| {
        b.push_var("coins")
            .push_int(1)
            .binary(BinaryOp::Subtract)
            .set("coins")
            .divert("square");
    });
    b.choice("Walk on", |b| {
        b.divert("square");
    });
    b.begin_knot("haggle")
        .text("Coins: ")
        .push_var("coins")
        .output()
        .newline()
        .tunnel_return();
    b.begin_knot("square").line("The square is quiet.");
    b.sticky_choice("Rest", |b| {
        b.text("Rolled ")
            .push_int(1)
            .push_int(100)
            .binary(BinaryOp::Random)
            .output()
            .newline()
            .end();
    });
    b.finish().unwrap()
}

/// Drive a runner with `picks`, rendering every step.
fn transcript(runner: &mut narrative_runtime::Runner, picks: &[usize]) -> Vec<String> {
    let mut out = Vec::new();
    let mut picks = picks.iter();
    loop {
        match runner.advance().unwrap() {
            Step::Line(line) => out.push(line.text),
            Step::Choices(choices) => {
                let texts: Vec<String> = choices.iter().map(|c| c.text.clone()).collect();
                out.push(format!("[{}]", texts.join(" | ")));
                match picks.next() {
                    Some(pick) => runner.choose(*pick).unwrap(),
                    None => return out,
                }
            }
            Step::Done => return out,
        }
    }
}

#[test]
fn restored_session_continues_identically() {
    let story = story();

    // Reference run, never saved.
    let globals = story.new_globals();
    let mut reference = story.runner(&globals).seed(5).build().unwrap();
    let head = transcript(&mut reference, &[]);
    let tail = transcript(&mut reference, &[0, 0]);

    // Same run, saved at the first choice point and restored.
    let globals = story.new_globals();
    let mut original = story.runner(&globals).seed(5).build().unwrap();
    assert_eq!(transcript(&mut original, &[]), head);
    let bytes = original.snapshot().unwrap().to_bytes().unwrap();
    drop(original);

    let snapshot = Snapshot::from_bytes(&story, &bytes).unwrap();
    assert_eq!(snapshot.runner_count(), 1);
    let (globals, mut runners) = snapshot.restore(&story).unwrap();
    let restored_tail = transcript(&mut runners[0], &[0, 0]);
    assert_eq!(restored_tail, tail);
    assert_eq!(globals.get("coins").unwrap(), Value::Int(1));
}

#[test]
fn snapshot_mid_text_resumes_mid_text() {
    let story = story();
    let globals = story.new_globals();
    let mut runner = story.runner(&globals).seed(9).build().unwrap();
    assert!(matches!(runner.advance().unwrap(), Step::Line(l) if l.text == "The market is loud."));

    let snapshot = runner.snapshot().unwrap();
    let expected = transcript(&mut runner, &[1, 0]);

    let globals = story.new_globals_from_snapshot(&snapshot).unwrap();
    let mut resumed = story.new_runner_from_snapshot(&globals, &snapshot, 0).unwrap();
    assert_eq!(transcript(&mut resumed, &[1, 0]), expected);
    assert!(expected[0].starts_with("Coins: 2"));
}

#[test]
fn snapshot_is_rejected_by_another_story() {
    let story = story();
    let globals = story.new_globals();
    let bytes = globals.snapshot().unwrap().to_bytes().unwrap();

    let mut b = StoryBuilder::new();
    b.begin_knot("elsewhere").line("Nothing here.");
    let other = b.finish().unwrap();

    assert!(matches!(
        Snapshot::from_bytes(&other, &bytes),
        Err(SnapshotError::StoryMismatch)
    ));
    assert!(matches!(
        Snapshot::from_bytes(&story, &bytes[..6]),
        Err(SnapshotError::FormatInvalid(_))
    ));
    assert!(matches!(
        Snapshot::from_bytes(&story, &bytes[..bytes.len() - 3]),
        Err(SnapshotError::FormatInvalid(_))
    ));
}

#[test]
fn snapshot_survives_a_file_round_trip() {
    let story = story();
    let globals = story.new_globals();
    let mut runner = story.runner(&globals).seed(3).build().unwrap();
    transcript(&mut runner, &[]);
    let snapshot = runner.snapshot().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("save.nrts");
    snapshot.write_to_file(&path).unwrap();
    let loaded = Snapshot::from_file(&story, &path).unwrap();
    assert_eq!(loaded.fingerprint(), story.fingerprint());

    let (_, mut runners) = loaded.restore(&story).unwrap();
    assert_eq!(
        transcript(&mut runners[0], &[1, 0]),
        transcript(&mut runner, &[1, 0])
    );
}

#[test]
fn globals_snapshot_carries_no_runners() {
    let story = story();
    let globals = story.new_globals();
    globals.set("coins", 9).unwrap();
    let snapshot = globals.snapshot().unwrap();
    assert_eq!(snapshot.runner_count(), 0);

    let restored = story.new_globals_from_snapshot(&snapshot).unwrap();
    assert_eq!(restored.get("coins").unwrap(), Value::Int(9));
    assert!(matches!(
        story.new_runner_from_snapshot(&restored, &snapshot, 0),
        Err(SnapshotError::RunnerIndex { index: 0, count: 0 })
    ));
}
