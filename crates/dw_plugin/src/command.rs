use std::future::Future;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PluginError;
use crate::logging::PluginLogger;
use crate::plugin::{EventSink, PluginEvent};

/// Metadata about a command, as listed by `get_commands`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub usage: String,
    #[serde(default)]
    pub help: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command failed with exit code {exit_code}: {message}")]
    Failed { exit_code: i32, message: String },

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

impl CommandError {
    pub fn failed(exit_code: i32, message: impl Into<String>) -> Self {
        CommandError::Failed { exit_code, message: message.into() }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Failed { exit_code, .. } => *exit_code,
            CommandError::Plugin(_) => 1,
        }
    }

    pub fn message(&self) -> String {
        match self {
            CommandError::Failed { message, .. } => message.clone(),
            CommandError::Plugin(err) => err.to_string(),
        }
    }
}

/// A named operation a command provider exposes to the CLI.
#[async_trait]
pub trait Command: Send + Sync {
    fn info(&self) -> CommandInfo;

    async fn execute(&self, ctx: &mut CommandContext, args: &[String]) -> Result<(), CommandError>;
}

/// Everything a running command may touch.
pub struct CommandContext {
    logger: PluginLogger,
    working_dir: PathBuf,
    stdin: Box<dyn BufRead + Send>,
    stdout: Box<dyn Write + Send>,
    events: Option<Arc<dyn EventSink>>,
}

impl CommandContext {
    /// Empty stdin, discarded stdout, no event sink.
    pub fn new(plugin: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            logger: PluginLogger::new(plugin),
            working_dir: working_dir.into(),
            stdin: Box::new(BufReader::new(io::empty())),
            stdout: Box::new(io::sink()),
            events: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl BufRead + Send + 'static) -> Self {
        self.stdin = Box::new(stdin);
        self
    }

    pub fn with_stdout(mut self, stdout: impl Write + Send + 'static) -> Self {
        self.stdout = Box::new(stdout);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn stdin(&mut self) -> &mut dyn BufRead {
        self.stdin.as_mut()
    }

    pub fn stdout(&mut self) -> &mut dyn Write {
        self.stdout.as_mut()
    }

    /// Emit an event on behalf of the owning plugin. Without a sink the
    /// event is dropped with a debug log.
    pub fn emit(&self, event: PluginEvent) -> impl Future<Output = Result<(), PluginError>> + Send + 'static {
        let sink = self.events.clone();
        let logger = self.logger.clone();
        async move {
            match sink {
                Some(sink) => sink.emit(event).await,
                None => {
                    logger.debug("emit", &format!("no event sink, dropping {}", event.event_type));
                    Ok(())
                }
            }
        }
    }
}

/// Cloneable in-memory writer, used to capture a command's stdout.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        match self.0.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self.0.lock().map_err(|_| io::Error::other("buffer poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Command for Echo {
        fn info(&self) -> CommandInfo {
            CommandInfo { name: "echo".into(), ..Default::default() }
        }

        async fn execute(&self, ctx: &mut CommandContext, args: &[String]) -> Result<(), CommandError> {
            if args.is_empty() {
                return Err(CommandError::failed(2, "nothing to echo"));
            }
            writeln!(ctx.stdout(), "{}", args.join(" ")).map_err(|e| PluginError::Internal(e.to_string()))?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn captured_stdout_and_exit_codes() {
        let out = SharedBuffer::new();
        let mut ctx = CommandContext::new("test", "/tmp").with_stdout(out.clone());
        Echo.execute(&mut ctx, &["hi".into(), "there".into()]).await.unwrap();
        assert_eq!(out.contents(), "hi there\n");

        let err = Echo.execute(&mut ctx, &[]).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.message(), "nothing to echo");
        assert_eq!(CommandError::from(PluginError::ReadOnly("x".into())).exit_code(), 1);
    }

    #[test]
    fn stdin_is_readable() {
        let mut ctx = CommandContext::new("test", ".").with_stdin(io::Cursor::new(b"line one\n".to_vec()));
        let mut line = String::new();
        ctx.stdin().read_line(&mut line).unwrap();
        assert_eq!(line, "line one\n");
    }
}
