use std::fs;
use std::io::{self, Read};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;

use picket::{Grammar, compile, match_captures, ops};

#[derive(Parser, Debug)]
#[command(version, about = "Match, replace and split text with PEG patterns", long_about = None)]
struct Args {
    /// PEG pattern or rule set (the first rule is the start)
    pattern: String,

    /// File to read; stdin when omitted
    #[arg(value_name = "FILE")]
    file: Option<String>,

    /// List every match with its byte offset
    #[arg(short = 'a', long)]
    all: bool,

    /// Replace matches with a $N template and print the result
    #[arg(short = 'r', long, value_name = "TEMPLATE", conflicts_with_all = ["all", "split"])]
    replace: Option<String>,

    /// Split the input on the pattern, one piece per line
    #[arg(short = 's', long, conflicts_with = "all")]
    split: bool,

    /// Also print capture spans for reported matches
    #[arg(short = 'c', long)]
    captures: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("picket: {err:#}");
            ExitCode::from(2)
        }
    }
}

/// Returns whether anything matched (exit status 0) or not (status 1).
fn run(args: &Args) -> Result<bool> {
    let grammar = compile(&args.pattern).context("invalid pattern")?;
    let input = read_input(args.file.as_deref())?;

    if let Some(template) = &args.replace {
        print!("{}", ops::replace_formatted(&input, &grammar, template));
        return Ok(ops::find(&grammar, &input, 0).is_some());
    }

    if args.split {
        for piece in ops::split(&input, &grammar) {
            println!("{piece}");
        }
        return Ok(true);
    }

    if args.all {
        let mut found = false;
        let mut start = 0;
        while let Some((offset, len)) = ops::find(&grammar, &input, start) {
            found = true;
            report_match(&grammar, &input, offset, len, args.captures);
            // A zero-length match still advances the scan.
            start = if len == 0 { offset + 1 } else { offset + len };
        }
        return Ok(found);
    }

    match ops::find(&grammar, &input, 0) {
        Some((offset, len)) => {
            report_match(&grammar, &input, offset, len, args.captures);
            Ok(true)
        }
        None => Ok(false),
    }
}

fn report_match(grammar: &Grammar, input: &str, offset: usize, len: usize, captures: bool) {
    println!("{}:{}:{}", offset, len, &input[offset..offset + len]);
    if captures && let Some(spans) = match_captures(grammar, input, offset) {
        let rendered = spans
            .iter()
            .map(|&(s, e)| format!("{s}..{e}={:?}", input.get(s..e).unwrap_or("")))
            .join(", ");
        println!("  captures: {rendered}");
    }
}

fn read_input(path: Option<&str>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(path).with_context(|| format!("failed to read {path}")),
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            Ok(buf)
        }
    }
}
