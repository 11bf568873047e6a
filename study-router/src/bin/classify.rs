//! Classify procedure descriptions from the command line
//!
//! Each argument (or each stdin line when there are none) is classified and
//! printed with its RVU and how the label was reached.

use std::io::BufRead;
use std::path::PathBuf;
use study_router::{Classification, RuleSet};

#[derive(Debug, Default)]
struct Args {
    rules: Option<PathBuf>,
    overlays: Vec<PathBuf>,
    json: bool,
    texts: Vec<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--rules" | "--overlay" => {
                let flag = args[i].clone();
                i += 1;
                let Some(path) = args.get(i) else {
                    eprintln!("{} needs a path", flag);
                    std::process::exit(1);
                };
                if flag == "--rules" {
                    parsed.rules = Some(PathBuf::from(path));
                } else {
                    parsed.overlays.push(PathBuf::from(path));
                }
            }
            "--json" => parsed.json = true,
            // Procedure text is tab-delimited; accept "\t" typed on a shell
            text => parsed.texts.push(text.replace("\\t", "\t")),
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!("rvu-classify - explain how procedure text is classified");
    println!();
    println!("USAGE:");
    println!("    rvu-classify [OPTIONS] [TEXT]...");
    println!();
    println!("Reads one description per line from stdin when no TEXT is given.");
    println!();
    println!("OPTIONS:");
    println!("        --rules <PATH>    Rule table replacing the built-in one");
    println!("        --overlay <PATH>  Overlay applied on top (repeatable)");
    println!("        --json            One JSON object per line");
    println!("    -h, --help            Print this help");
}

fn print(text: &str, classification: &Classification, json: bool) {
    if json {
        let line = serde_json::json!({
            "text": text,
            "study_type": classification.study_type,
            "rvu": classification.rvu,
            "matched_by": classification.matched_by.to_string(),
        });
        println!("{}", line);
    } else {
        println!(
            "{:<32} {:>6.2}  {:<24} {}",
            classification.study_type,
            classification.rvu,
            classification.matched_by.to_string(),
            text.replace('\t', " | ")
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();
    let rules = RuleSet::load_layered(args.rules.as_deref(), &args.overlays)?;

    if args.texts.is_empty() {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            print(&line, &study_router::classify(&line, &rules), args.json);
        }
    } else {
        for text in &args.texts {
            print(text, &study_router::classify(text, &rules), args.json);
        }
    }

    Ok(())
}
