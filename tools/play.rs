/// Play: run a compiled story in the terminal.
///
/// Usage: play <story.nrtb | story.ron> [--seed <n>] [--start <path>] [--load <save>]
///
/// At a choice prompt:
///   <n>               take choice n
///   get <var>         print a global
///   set <var> <int>   assign an integer global and re-check the choices
///   save <path>       write a snapshot
///   quit              exit
///
/// Set RUST_LOG (e.g. `RUST_LOG=narrative_runtime=debug`) to see runner logs.
use narrative_runtime::{Globals, Runner, Snapshot, Step, Story};
use std::io::{self, BufRead, Write};
use std::path::Path;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage();
        return;
    }

    let story_path = args[1].clone();
    let mut seed: u64 = 0;
    let mut start: Option<String> = None;
    let mut save_path: Option<String> = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--seed" if i + 1 < args.len() => {
                i += 1;
                seed = args[i].parse().unwrap_or(0);
            }
            "--start" if i + 1 < args.len() => {
                i += 1;
                start = Some(args[i].clone());
            }
            "--load" if i + 1 < args.len() => {
                i += 1;
                save_path = Some(args[i].clone());
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let story = match load_story(Path::new(&story_path)) {
        Ok(story) => story,
        Err(e) => {
            eprintln!("Failed to load {}: {}", story_path, e);
            std::process::exit(1);
        }
    };
    for tag in story.global_tags() {
        println!("# {}", tag);
    }

    let session = open_session(&story, seed, start.as_deref(), save_path.as_deref());
    let (globals, mut runner) = match session {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        let step = match runner.advance() {
            Ok(step) => step,
            Err(e) => {
                println!("ERROR: {}", e);
                break;
            }
        };
        match step {
            Step::Line(line) => {
                println!("{}", line.text);
                for tag in &line.tags {
                    println!("  # {}", tag);
                }
            }
            Step::Done => {
                println!("-- The End --");
                break;
            }
            Step::Choices(choices) => {
                println!();
                for choice in &choices {
                    println!("  {}: {}", choice.index, choice.text);
                }
                loop {
                    print!("> ");
                    stdout.flush().ok();
                    let mut input = String::new();
                    if stdin.lock().read_line(&mut input).is_err() || input.is_empty() {
                        return;
                    }
                    let parts: Vec<&str> = input.split_whitespace().collect();
                    match parts.as_slice() {
                        [] => continue,
                        ["quit" | "q"] => return,
                        ["get", name] => match globals.get(name) {
                            Ok(value) => println!("{} = {:?}", name, value),
                            Err(e) => println!("ERROR: {}", e),
                        },
                        ["set", name, value] => {
                            let Ok(value) = value.parse::<i32>() else {
                                println!("Usage: set <var> <int>");
                                continue;
                            };
                            if let Err(e) = globals.set(name, value) {
                                println!("ERROR: {}", e);
                                continue;
                            }
                            match runner.reevaluate_choices() {
                                Ok(Step::Choices(choices)) => {
                                    for choice in &choices {
                                        println!("  {}: {}", choice.index, choice.text);
                                    }
                                }
                                Ok(_) => break,
                                Err(e) => println!("ERROR: {}", e),
                            }
                        }
                        ["save", path] => {
                            let saved = runner
                                .snapshot()
                                .and_then(|snapshot| snapshot.write_to_file(Path::new(path)));
                            match saved {
                                Ok(()) => println!("Saved to {}", path),
                                Err(e) => println!("ERROR: {}", e),
                            }
                        }
                        [n] => match n.parse::<usize>() {
                            Ok(index) => match runner.choose(index) {
                                Ok(()) => break,
                                Err(e) => println!("ERROR: {}", e),
                            },
                            Err(_) => println!("Unknown command: {}", n),
                        },
                        _ => println!("Unknown command: {}", input.trim()),
                    }
                }
            }
        }
    }
}

fn load_story(path: &Path) -> Result<Story, narrative_runtime::StoryError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Story::load_from_ron(path),
        _ => Story::load_from_file(path),
    }
}

fn open_session(
    story: &Story,
    seed: u64,
    start: Option<&str>,
    save: Option<&str>,
) -> Result<(Globals, Runner), Box<dyn std::error::Error>> {
    if let Some(save) = save {
        let snapshot = Snapshot::from_file(story, Path::new(save))?;
        let globals = story.new_globals_from_snapshot(&snapshot)?;
        let runner = story.new_runner_from_snapshot(&globals, &snapshot, 0)?;
        println!("Resumed from {}", save);
        return Ok((globals, runner));
    }
    let globals = story.new_globals();
    let mut builder = story.runner(&globals).seed(seed);
    if let Some(path) = start {
        builder = builder.start_at(path);
    }
    let runner = builder.build()?;
    Ok((globals, runner))
}

fn print_usage() {
    println!("Usage: play <story.nrtb | story.ron> [--seed <n>] [--start <path>] [--load <save>]");
    println!();
    println!("At a choice prompt:");
    println!("  <n>               take choice n");
    println!("  get <var>         print a global");
    println!("  set <var> <int>   assign an integer global and re-check the choices");
    println!("  save <path>       write a snapshot");
    println!("  quit              exit");
}
