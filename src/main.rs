use weft_rust::{error::WeftError, Context, Datum, FileLoader, Position};

use std::io::{self, Read};

fn main() {
    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: weft <template> [name=value]...");
        std::process::exit(2);
    };

    let mut context = Context::new();
    for assignment in args {
        match assignment.split_once('=') {
            Some((name, value)) => context.set(name, parse_value(value)),
            None => {
                eprintln!("ERROR: expecting name=value, got '{}'", assignment);
                std::process::exit(2);
            }
        }
    }

    let source = if path == "-" {
        let mut input = String::new();
        if let Err(e) = io::stdin().read_to_string(&mut input) {
            eprintln!("ERROR: could not read stdin: {}", e);
            std::process::exit(1);
        }
        input
    } else {
        match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("ERROR: could not read '{}': {}", path, e);
                std::process::exit(1);
            }
        }
    };

    // Includes resolve relative to the template's own path.
    let loader = FileLoader::new("");
    let result = weft_rust::parse_template_with_loader(&path, &source, &loader)
        .and_then(|mut template| template.evaluate(&context));

    match result {
        Ok(output) => print!("{}", output),
        Err(err) => {
            report(&err, &source);
            std::process::exit(1);
        }
    }
}

// Command-line values keep their natural type where one is recognizable.
fn parse_value(text: &str) -> Datum {
    match text {
        "true" => return Datum::from(true),
        "false" => return Datum::from(false),
        "null" => return Datum::null(),
        _ => {}
    }
    if let Ok(value) = text.parse::<i64>() {
        return Datum::from(value);
    }
    if let Ok(value) = text.parse::<f64>() {
        return Datum::from(value);
    }
    Datum::from(text)
}

fn report(err: &WeftError, source: &str) {
    let position = Position::of(source, err.offset);
    let lines: Vec<&str> = source.lines().collect();
    let line_text = lines.get(position.line).unwrap_or(&"");

    eprintln!("ERROR AT LINE {}:", position.line + 1);
    eprintln!("{}", line_text);

    let mut underline = String::new();
    for _ in 0..position.column {
        underline.push(' ');
    }
    underline.push('^');
    eprintln!("{}", underline);
    eprintln!("{}", err);
    eprintln!();
}
