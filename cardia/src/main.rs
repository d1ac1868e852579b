use cardia::mmt::{Parser, Precision, Severity, SeverityMap, UnitMode};
use clap::Parser as ClapParser;
use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term::termcolor::{ColorChoice, StandardStream};
use std::error::Error;
use std::process::exit;

#[derive(clap::Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The expression to check, e.g. "1 [mV] + sqrt(4 [mV^2])"
    expression: String,
    #[arg(short, long, help = "Treat the argument as a file to read")]
    file: bool,
    #[arg(short, long, help = "Only report problems, do not print results")]
    quiet: bool,
}

fn line_offsets(text: &str) -> Vec<usize> {
    let mut offsets = vec![0];
    for (index, ch) in text.char_indices() {
        if ch == '\n' {
            offsets.push(index + 1);
        }
    }
    offsets
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let text = if args.file {
        std::fs::read_to_string(&args.expression)?
    } else {
        args.expression.clone()
    };
    let text = text.trim().to_string();

    let mut parser = Parser::new(&text, None);
    let result = parser.parse();
    let mut diagnostics = parser.diagnostics;
    let expr = match result {
        Ok(expr) => Some(expr),
        Err(diagnostic) => {
            diagnostics.push(diagnostic);
            None
        }
    };

    let severities = SeverityMap::default();
    let mut has_errors = false;
    if !diagnostics.is_empty() {
        let mut files = SimpleFiles::new();
        let name = if args.file {
            args.expression.clone()
        } else {
            "<expression>".to_string()
        };
        let file_id = files.add(name, text.clone());
        let offsets = line_offsets(&text);

        let writer = StandardStream::stderr(ColorChoice::Auto);
        let config = codespan_reporting::term::Config::default();
        for diagnostic in diagnostics {
            if severities[diagnostic.code()] == Severity::Error {
                has_errors = true;
            }
            let rendered = diagnostic.into_codespan_diagnostic(file_id, &offsets, &severities);
            codespan_reporting::term::emit(&mut writer.lock(), &config, &files, &rendered)?;
        }
    }

    let Some(expr) = expr else {
        exit(1);
    };
    if has_errors {
        exit(1);
    }

    if !args.quiet {
        println!("expression: {}", expr.code(None));
    }

    match expr.eval(None, Precision::Double) {
        Ok(value) => {
            if !args.quiet {
                println!("value: {}", cardia::mmt::format_number(value));
            }
        }
        Err(error) => {
            eprintln!("{error}");
            exit(1);
        }
    }

    for (label, mode) in [("units", UnitMode::Tolerant), ("strict", UnitMode::Strict)] {
        match expr.eval_unit(mode) {
            Ok(Some(unit)) => {
                if !args.quiet {
                    println!("{label}: {unit}");
                }
            }
            Ok(None) => {
                if !args.quiet {
                    println!("{label}: not specified");
                }
            }
            Err(error) => {
                eprintln!("{error}");
                exit(1);
            }
        }
    }

    exit(0);
}
