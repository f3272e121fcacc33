use async_trait::async_trait;
use fieldsync::{ExtensionResolver, RecordReference, RemoteRecord, SyncError};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::Mutex;

/// Extensions offered when a record does not declare one.
pub const EXTENSION_CHOICES: [&str; 3] = ["xml", "py", "other"];

/// Line-oriented questions on a terminal. Everything typed while watching is
/// read through the same instance so prompts and commands never race for input.
pub struct Prompter {
    lines: Lines<Box<dyn AsyncBufRead + Unpin + Send>>,
    out: Box<dyn Write + Send>,
}

impl Prompter {
    pub fn new(input: Box<dyn AsyncBufRead + Unpin + Send>, out: Box<dyn Write + Send>) -> Self {
        Self {
            lines: input.lines(),
            out,
        }
    }

    pub fn stdio() -> Self {
        Self::new(
            Box::new(BufReader::new(tokio::io::stdin())),
            Box::new(io::stdout()),
        )
    }

    /// Next trimmed line, `None` at end of input.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.lines.next_line().await?.map(|l| l.trim().to_string()))
    }

    /// Asks until a non-empty answer is given; an empty line takes `default`.
    pub async fn ask(&mut self, question: &str, default: Option<&str>) -> io::Result<String> {
        loop {
            match default {
                Some(default) => write!(self.out, "{} ({}): ", question, default)?,
                None => write!(self.out, "{}: ", question)?,
            }
            self.out.flush()?;

            let answer = self.read_line().await?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "input closed")
            })?;
            match (answer.is_empty(), default) {
                (false, _) => return Ok(answer),
                (true, Some(default)) => return Ok(default.to_string()),
                (true, None) => continue,
            }
        }
    }

    /// Asks for one of `choices`, by name or 1-based number.
    pub async fn choose(
        &mut self,
        question: &str,
        choices: &[&str],
        default: &str,
    ) -> io::Result<String> {
        loop {
            let answer = self
                .ask(&format!("{} [{}]", question, choices.join("/")), Some(default))
                .await?;
            if let Some(choice) = pick(&answer, choices) {
                return Ok(choice.to_string());
            }
            writeln!(self.out, "Please answer one of: {}", choices.join(", "))?;
        }
    }

    pub fn say(&mut self, message: &str) -> io::Result<()> {
        writeln!(self.out, "{}", message)?;
        self.out.flush()
    }
}

fn pick<'a>(answer: &str, choices: &[&'a str]) -> Option<&'a str> {
    if let Ok(n) = answer.parse::<usize>() {
        return n.checked_sub(1).and_then(|i| choices.get(i)).copied();
    }
    choices
        .iter()
        .find(|choice| choice.eq_ignore_ascii_case(answer))
        .copied()
}

/// Asks which extension to use, unless one was given up front.
pub struct PromptExtension {
    prompter: Arc<Mutex<Prompter>>,
    preset: Option<String>,
}

impl PromptExtension {
    pub fn new(prompter: Arc<Mutex<Prompter>>, preset: Option<String>) -> Self {
        Self { prompter, preset }
    }
}

#[async_trait]
impl ExtensionResolver for PromptExtension {
    async fn resolve_extension(
        &self,
        reference: &RecordReference,
        _record: &RemoteRecord,
    ) -> fieldsync::Result<String> {
        if let Some(ext) = &self.preset {
            return Ok(ext.clone());
        }
        let mut prompter = self.prompter.lock().await;
        let question = format!("File extension for {}", reference);
        let choice = prompter
            .choose(&question, &EXTENSION_CHOICES, EXTENSION_CHOICES[0])
            .await
            .map_err(SyncError::Io)?;
        if choice == "other" {
            return prompter
                .ask("Extension", None)
                .await
                .map_err(SyncError::Io);
        }
        Ok(choice)
    }
}
