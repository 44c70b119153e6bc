use super::Ui;
use crate::{PluginError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Line-oriented Ui over a pair of writers and an optional reader.
pub struct BasicUi {
    out: tokio::sync::Mutex<Writer>,
    err: tokio::sync::Mutex<Writer>,
    input: tokio::sync::Mutex<Option<Reader>>,
}

impl BasicUi {
    pub fn new(out: Writer, err: Writer) -> Self {
        Self {
            out: tokio::sync::Mutex::new(out),
            err: tokio::sync::Mutex::new(err),
            input: tokio::sync::Mutex::new(None),
        }
    }

    /// A Ui on the process's own stdout, stderr and stdin.
    pub fn stdio() -> Self {
        Self::new(Box::new(tokio::io::stdout()), Box::new(tokio::io::stderr()))
            .with_input(Box::new(tokio::io::BufReader::new(tokio::io::stdin())))
    }

    pub fn with_input(self, input: Reader) -> Self {
        Self {
            input: tokio::sync::Mutex::new(Some(input)),
            ..self
        }
    }

    async fn write_line(writer: &tokio::sync::Mutex<Writer>, line: &str) {
        let mut writer = writer.lock().await;
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to write Ui output: {}", e);
        }
    }
}

#[async_trait]
impl Ui for BasicUi {
    async fn say(&self, message: &str) {
        Self::write_line(&self.out, message).await;
    }

    async fn message(&self, message: &str) {
        Self::write_line(&self.out, message).await;
    }

    async fn error(&self, message: &str) {
        Self::write_line(&self.err, message).await;
    }

    async fn machine(&self, kind: &str, args: &[String]) {
        let line = std::iter::once(kind.to_string())
            .chain(args.iter().map(|arg| arg.replace(',', "%!(PACKER_COMMA)")))
            .collect::<Vec<_>>()
            .join(",");
        Self::write_line(&self.out, &line).await;
    }

    async fn ask(&self, query: &str) -> Result<String> {
        Self::write_line(&self.out, query).await;
        let mut input = self.input.lock().await;
        let reader = input.as_mut().ok_or_else(|| {
            PluginError::Other("Ui has no input to answer questions from".to_string())
        })?;
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(PluginError::Other("input closed while asking".to_string()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Prefixes every line with a build name, as `==> name: message`.
pub struct PrefixedUi {
    prefix: String,
    inner: Arc<dyn Ui>,
}

impl PrefixedUi {
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Ui>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

#[async_trait]
impl Ui for PrefixedUi {
    async fn say(&self, message: &str) {
        self.inner
            .say(&format!("==> {}: {}", self.prefix, message))
            .await;
    }

    async fn message(&self, message: &str) {
        self.inner
            .message(&format!("    {}: {}", self.prefix, message))
            .await;
    }

    async fn error(&self, message: &str) {
        self.inner
            .error(&format!("==> {}: {}", self.prefix, message))
            .await;
    }

    async fn machine(&self, kind: &str, args: &[String]) {
        let mut prefixed = Vec::with_capacity(args.len() + 1);
        prefixed.push(self.prefix.clone());
        prefixed.extend_from_slice(args);
        self.inner.machine(kind, &prefixed).await;
    }

    async fn ask(&self, query: &str) -> Result<String> {
        self.inner
            .ask(&format!("==> {}: {}", self.prefix, query))
            .await
    }
}

/// One recorded Ui call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Say(String),
    Message(String),
    Error(String),
    Machine(String, Vec<String>),
    Ask(String),
}

/// Ui that records every call, with canned answers for `ask`.
#[derive(Debug, Default)]
pub struct RecordingUi {
    events: Mutex<Vec<UiEvent>>,
    answers: Mutex<VecDeque<String>>,
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answers<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            events: Mutex::new(Vec::new()),
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
        }
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().clone()
    }

    /// Messages passed to `say`, in order.
    pub fn said(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                UiEvent::Say(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: UiEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl Ui for RecordingUi {
    async fn say(&self, message: &str) {
        self.record(UiEvent::Say(message.to_string()));
    }

    async fn message(&self, message: &str) {
        self.record(UiEvent::Message(message.to_string()));
    }

    async fn error(&self, message: &str) {
        self.record(UiEvent::Error(message.to_string()));
    }

    async fn machine(&self, kind: &str, args: &[String]) {
        self.record(UiEvent::Machine(kind.to_string(), args.to_vec()));
    }

    async fn ask(&self, query: &str) -> Result<String> {
        self.record(UiEvent::Ask(query.to_string()));
        self.answers
            .lock()
            .pop_front()
            .ok_or_else(|| PluginError::Other(format!("no answer for: {query}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_ui_writes_lines_and_reads_answers() {
        let (out_writer, mut out_reader) = tokio::io::duplex(1024);
        let (err_writer, mut err_reader) = tokio::io::duplex(1024);
        let input: &'static [u8] = b"yes\n";

        let ui = BasicUi::new(Box::new(out_writer), Box::new(err_writer))
            .with_input(Box::new(input));

        ui.say("hello").await;
        ui.error("bad").await;
        ui.machine("artifact", &["0".into(), "a,b".into()]).await;
        assert_eq!(ui.ask("continue?").await.unwrap(), "yes");
        drop(ui);

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut out_reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello\nartifact,0,a%!(PACKER_COMMA)b\ncontinue?\n");

        let mut err = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut err_reader, &mut err)
            .await
            .unwrap();
        assert_eq!(err, "bad\n");
    }

    #[tokio::test]
    async fn test_basic_ui_without_input_refuses_to_ask() {
        let ui = BasicUi::new(Box::new(tokio::io::sink()), Box::new(tokio::io::sink()));
        assert!(ui.ask("anything?").await.is_err());
    }

    #[tokio::test]
    async fn test_prefixed_ui() {
        let recorder = Arc::new(RecordingUi::new());
        let ui = PrefixedUi::new("web", recorder.clone());

        ui.say("Creating instance").await;
        ui.message("still waiting").await;
        ui.machine("id", &["i-123".into()]).await;

        assert_eq!(
            recorder.events(),
            vec![
                UiEvent::Say("==> web: Creating instance".into()),
                UiEvent::Message("    web: still waiting".into()),
                UiEvent::Machine("id".into(), vec!["web".into(), "i-123".into()]),
            ]
        );
    }

    #[tokio::test]
    async fn test_recording_ui_answers_in_order() {
        let ui = RecordingUi::with_answers(["a", "b"]);
        assert_eq!(ui.ask("1").await.unwrap(), "a");
        assert_eq!(ui.ask("2").await.unwrap(), "b");
        assert!(ui.ask("3").await.is_err());
        assert_eq!(ui.events().len(), 3);
    }
}
