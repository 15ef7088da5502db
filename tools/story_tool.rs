/// Story Tool: convert and inspect compiled stories.
///
/// Usage:
///   story_tool pack <story.ron> <story.nrtb>   validate RON story data and write the binary form
///   story_tool dump <story.nrtb>               print a binary story as RON
///   story_tool info <story.nrtb | story.ron>   print a summary of a story
use narrative_runtime::schema::story_data::ContainerKind;
use narrative_runtime::Story;
use std::path::Path;
use std::process;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let arg = |i: usize| args.get(i).map(String::as_str);

    match (arg(1), arg(2), arg(3)) {
        (Some("pack"), Some(input), Some(output)) => {
            let story = load_or_exit(Path::new(input));
            if let Err(e) = story.write_to_file(Path::new(output)) {
                eprintln!("ERROR: Failed to write {}: {}", output, e);
                process::exit(1);
            }
            println!(
                "Packed {} instructions into {} ({:016x})",
                story.len(),
                output,
                story.fingerprint()
            );
        }
        (Some("dump"), Some(input), None) => {
            let story = load_or_exit(Path::new(input));
            let config = ron::ser::PrettyConfig::default();
            match ron::ser::to_string_pretty(story.data(), config) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    eprintln!("ERROR: Failed to render {}: {}", input, e);
                    process::exit(1);
                }
            }
        }
        (Some("info"), Some(input), None) => {
            let story = load_or_exit(Path::new(input));
            print_info(&story);
        }
        _ => {
            println!("Usage:");
            println!("  story_tool pack <story.ron> <story.nrtb>");
            println!("  story_tool dump <story.nrtb>");
            println!("  story_tool info <story.nrtb | story.ron>");
            process::exit(if arg(1).is_some_and(|a| a == "--help" || a == "-h") { 0 } else { 1 });
        }
    }
}

fn load_or_exit(path: &Path) -> Story {
    let loaded = match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Story::load_from_ron(path),
        _ => Story::load_from_file(path),
    };
    match loaded {
        Ok(story) => story,
        Err(e) => {
            eprintln!("ERROR: Failed to load {}: {}", path.display(), e);
            process::exit(1);
        }
    }
}

fn print_info(story: &Story) {
    let data = story.data();
    println!("Fingerprint:  {:016x}", story.fingerprint());
    println!("Instructions: {}", data.instructions.len());
    println!("Strings:      {}", data.strings.len());
    println!("Containers:   {}", data.containers.len());

    let knots: Vec<&str> = data
        .containers
        .iter()
        .filter(|c| matches!(c.kind, ContainerKind::Knot | ContainerKind::Function))
        .map(|c| c.path.as_str())
        .collect();
    println!("Knots:        {}", knots.join(", "));

    for global in story.global_decls() {
        println!("  VAR {} = {:?}", global.name, global.default);
    }
    for origin in &story.lists().origins {
        let flags: Vec<String> = origin
            .flags
            .iter()
            .map(|f| format!("{}={}", f.name, f.value))
            .collect();
        println!("  LIST {} = {}", origin.name, flags.join(", "));
    }
    for tag in story.global_tags() {
        println!("  # {}", tag);
    }
}
