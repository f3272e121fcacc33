use anyhow::{Context, Result};
use fieldsync::{SyncEngine, SyncReport};
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::prompt::Prompter;

/// What to open next; `None` parts are asked for.
#[derive(Debug, Default)]
pub struct Target {
    pub locator: Option<String>,
    pub field: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Switch,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.to_ascii_lowercase().as_str() {
        "switch" | "s" => Some(Command::Switch),
        "quit" | "q" | "exit" => Some(Command::Quit),
        _ => None,
    }
}

/// Runs sessions until the user quits, input ends before a record was chosen,
/// or the process is asked to stop (Ctrl-C, and SIGTERM or SIGHUP on unix).
/// The last session is always closed and its file removed.
pub async fn run(mut engine: SyncEngine, prompter: Arc<Mutex<Prompter>>, first: Target) -> Result<()> {
    let printer = tokio::spawn(print_reports(engine.subscribe()));
    let shutdown = Shutdown::listen()?;

    let result = tokio::select! {
        result = drive(&mut engine, &prompter, first) => result,
        stopped = shutdown.recv() => stopped.map(|name| debug!(signal = name, "stopping")),
    };

    let closed = engine.close().await;
    // Dropping the engine closes the report channel, which ends the printer.
    drop(engine);
    if let Err(e) = printer.await {
        debug!("report printer ended abnormally: {}", e);
    }

    result?;
    closed.context("could not clean up the scratch file")
}

/// Signals that end the program. Handlers are installed up front so a signal
/// arriving at any point is caught rather than killing the process.
struct Shutdown {
    #[cfg(unix)]
    terminate: Signal,
    #[cfg(unix)]
    hangup: Signal,
}

impl Shutdown {
    fn listen() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: signal(SignalKind::terminate()).context("could not listen for SIGTERM")?,
            #[cfg(unix)]
            hangup: signal(SignalKind::hangup()).context("could not listen for SIGHUP")?,
        })
    }

    /// Name of the first signal received.
    #[cfg(unix)]
    async fn recv(mut self) -> Result<&'static str> {
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("could not listen for Ctrl-C")?;
                Ok("interrupt")
            }
            _ = self.terminate.recv() => Ok("terminate"),
            _ = self.hangup.recv() => Ok("hangup"),
        }
    }

    #[cfg(not(unix))]
    async fn recv(self) -> Result<&'static str> {
        tokio::signal::ctrl_c()
            .await
            .context("could not listen for Ctrl-C")?;
        Ok("interrupt")
    }
}

async fn drive(engine: &mut SyncEngine, prompter: &Mutex<Prompter>, first: Target) -> Result<()> {
    let default_field = engine.config().default_field.clone();
    let mut target = first;
    loop {
        if !open(engine, prompter, &mut target, &default_field).await? {
            return Ok(());
        }
        prompter
            .lock()
            .await
            .say("Edit and save the file to update the record. Commands: switch, quit")?;

        match next_command(prompter).await? {
            Command::Quit => return Ok(()),
            Command::Switch => {
                engine.close().await?;
                target = Target::default();
            }
        }
    }
}

/// Opens a session, asking again after every failed attempt.
/// Returns `false` when input ends first.
async fn open(
    engine: &mut SyncEngine,
    prompter: &Mutex<Prompter>,
    target: &mut Target,
    default_field: &str,
) -> Result<bool> {
    loop {
        let locator = match target.locator.take() {
            Some(locator) => locator,
            None => match ask(prompter, "Record URL", None).await? {
                Some(locator) => locator,
                None => return Ok(false),
            },
        };
        let field = match target.field.take() {
            Some(field) => field,
            None => match ask(prompter, "Field name", Some(default_field)).await? {
                Some(field) => field,
                None => return Ok(false),
            },
        };

        match engine.open(&locator, Some(&field)).await {
            Ok(_) => return Ok(true),
            // Every failed attempt leaves the engine idle, so just ask again.
            Err(e) => eprintln!("Error: {}", e),
        }
    }
}

/// `None` when input has ended.
async fn ask(prompter: &Mutex<Prompter>, question: &str, default: Option<&str>) -> Result<Option<String>> {
    match prompter.lock().await.ask(question, default).await {
        Ok(answer) => Ok(Some(answer)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Waits for `switch` or `quit`. Once input has ended only Ctrl-C is left.
async fn next_command(prompter: &Mutex<Prompter>) -> Result<Command> {
    loop {
        let mut prompter = prompter.lock().await;
        let Some(line) = prompter.read_line().await? else {
            debug!("input closed, waiting for Ctrl-C");
            drop(prompter);
            match std::future::pending::<Infallible>().await {}
        };
        if line.is_empty() {
            continue;
        }
        match parse_command(&line) {
            Some(command) => return Ok(command),
            None => prompter.say(&format!("Unknown command {:?}. Commands: switch, quit", line))?,
        }
    }
}

async fn print_reports(mut reports: broadcast::Receiver<SyncReport>) {
    loop {
        match reports.recv().await {
            Ok(report @ SyncReport::PushFailed { .. }) => eprintln!("{}", report),
            Ok(report) => println!("{}", report),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "report output fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
