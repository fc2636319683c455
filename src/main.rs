use clap::{ArgAction, Parser};
use log::{error, LevelFilter};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use simfs::shell::{Reply, Shell};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

/// Inode filesystem kept inside a single host file.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Image file; created by `format` when it does not exist yet
    image: PathBuf,
    /// Run the commands in FILE instead of prompting
    #[arg(short, long, value_name = "FILE")]
    script: Option<PathBuf>,
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(level(args.verbose))
        .init();
    if let Err(err) = simfs::signal::install_interrupt_handler() {
        error!("cannot install the SIGINT handler: {err}");
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("simfs: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut shell = Shell::open(&args.image)?;

    if let Some(script) = args.script {
        for line in shell.load(&script)? {
            println!("{line}");
        }
        shell.close()?;
        return Ok(());
    }

    let mut rl = DefaultEditor::new()?;
    loop {
        match rl.readline(&shell.prompt()) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    rl.add_history_entry(line.as_str())?;
                }
                match shell.exec(&line) {
                    Ok(Reply::Done) => {}
                    Ok(Reply::Text(text)) if text.is_empty() => {}
                    Ok(Reply::Text(text)) => println!("{text}"),
                    Ok(Reply::Exit) => break,
                    Err(err) => println!("{err}"),
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        }
    }
    shell.close()?;
    Ok(())
}
