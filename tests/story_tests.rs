/// Story loading tests: the RON fixture, the binary form and rejection of
/// malformed input.
use narrative_runtime::core::story::{STORY_FORMAT_VERSION, STORY_MAGIC};
use narrative_runtime::{Step, Story, StoryError, Value};
use std::path::Path;

fn tavern() -> Story {
    Story::load_from_ron(Path::new("tests/fixtures/tavern.ron")).unwrap()
}

#[test]
fn fixture_plays_through() {
    let story = tavern();
    assert_eq!(story.global_tags(), ["title: The Tavern".to_string()]);
    assert_eq!(
        story.knot_tags("tavern"),
        Some(&["location: tavern".to_string()][..])
    );

    let globals = story.new_globals();
    let mut runner = story.new_runner(&globals).unwrap();
    let mut lines = Vec::new();
    let offered = loop {
        match runner.advance().unwrap() {
            Step::Line(line) => lines.push(line.text),
            Step::Choices(choices) => break choices,
            Step::Done => panic!("ended before the choice"),
        }
    };
    assert_eq!(lines, vec!["Welcome to the tavern.", "You have 3 gold."]);
    let texts: Vec<&str> = offered.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["Buy ale", "Leave"]);

    runner.choose(0).unwrap();
    assert_eq!(runner.read_all().unwrap(), "Buy ale\nCheers!");
    assert_eq!(globals.get("gold").unwrap(), Value::Int(2));
    assert_eq!(runner.advance().unwrap(), Step::Done);
}

#[test]
fn binary_form_round_trips_through_a_file() {
    let story = tavern();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tavern.nrtb");
    story.write_to_file(&path).unwrap();

    let loaded = Story::load_from_file(&path).unwrap();
    assert_eq!(loaded.fingerprint(), story.fingerprint());
    assert_eq!(loaded.data(), story.data());
    assert!(!loaded.ptr_eq(&story));
    assert_eq!(loaded.container_by_path("tavern.c-1").map(|id| id.0), Some(2));
}

#[test]
fn header_is_checked_before_the_payload() {
    let story = tavern();
    let bytes = story.to_bytes().unwrap();
    assert_eq!(&bytes[..4], &STORY_MAGIC[..]);

    let mut wrong_magic = bytes.clone();
    wrong_magic[0] = b'X';
    assert!(matches!(
        Story::load(&wrong_magic),
        Err(StoryError::FormatInvalid(_))
    ));

    let mut newer = bytes.clone();
    newer[4..8].copy_from_slice(&(STORY_FORMAT_VERSION + 1).to_le_bytes());
    assert!(matches!(
        Story::load(&newer),
        Err(StoryError::VersionMismatch { found, expected })
            if found == STORY_FORMAT_VERSION + 1 && expected == STORY_FORMAT_VERSION
    ));

    assert!(matches!(
        Story::load(&bytes[..bytes.len() / 2]),
        Err(StoryError::FormatInvalid(_))
    ));
}

#[test]
fn broken_ron_is_rejected() {
    assert!(matches!(
        Story::parse_ron("(instructions: [Text(0)], strings: [], containers: [], entry: 0)"),
        Err(StoryError::FormatInvalid(_))
    ));
    assert!(matches!(
        Story::parse_ron("(instructions: [Nonsense], strings: [], containers: [], entry: 0)"),
        Err(StoryError::Ron(_))
    ));
}
