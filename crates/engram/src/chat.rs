//! Interactive conversation driver
//!
//! Routes each line of user input: `exit` ends the session, `recall <topic>`
//! queries stored memories and merges the hits into the next prompt, and
//! anything else goes to the generator. Generator replies are fed to the
//! memory manager; any reinjection block it returns is merged into the
//! context of the following prompt.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::completion::ChatMessage;
use crate::error::Result;
use crate::generator::Generator;
use crate::memory::manager::{MemoryManager, RecalledMemory, TurnReport};
use crate::memory::types::MetricsSnapshot;
use crate::session::SessionId;

const RECALL_PREFIX: &str = "recall ";
const DEFAULT_MAX_HISTORY_TURNS: usize = 6;

/// Parsed line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    Exit,
    Recall(String),
    Message(String),
    Empty,
}

pub fn parse_input(line: &str) -> UserInput {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return UserInput::Empty;
    }
    if trimmed.eq_ignore_ascii_case("exit") {
        return UserInput::Exit;
    }

    let is_recall = trimmed
        .get(..RECALL_PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(RECALL_PREFIX));
    if is_recall {
        let topic = trimmed[RECALL_PREFIX.len()..].trim();
        if !topic.is_empty() {
            return UserInput::Recall(topic.to_string());
        }
    }

    UserInput::Message(trimmed.to_string())
}

/// Outcome of one line of input
#[derive(Debug)]
pub enum ChatReply {
    /// Recall hits, now staged for the next prompt
    Recalled(Vec<RecalledMemory>),
    /// Generator reply and what the memory manager did with it
    Answer { text: String, report: TurnReport },
    /// The generator failed; nothing was stored
    GeneratorFailed(String),
    /// Session ended
    Exit(MetricsSnapshot),
    Nothing,
}

/// One chat session bound to a manager and a generator
pub struct Conversation {
    manager: Arc<MemoryManager>,
    generator: Arc<dyn Generator>,
    session_id: SessionId,
    system_prompt: String,
    history: Vec<ChatMessage>,
    pending_context: Vec<String>,
    max_history_turns: usize,
}

impl Conversation {
    pub fn new(
        manager: Arc<MemoryManager>,
        generator: Arc<dyn Generator>,
        session_id: SessionId,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            generator,
            session_id,
            system_prompt: system_prompt.into(),
            history: Vec::new(),
            pending_context: Vec::new(),
            max_history_turns: DEFAULT_MAX_HISTORY_TURNS,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Context staged for the next prompt
    pub fn pending_context(&self) -> &[String] {
        &self.pending_context
    }

    /// Full prompt for `user_text`: system message (with staged context),
    /// recent history, then the new message
    pub fn build_prompt(&self, user_text: &str) -> Vec<ChatMessage> {
        let mut system = self.system_prompt.clone();
        if !self.pending_context.is_empty() {
            system.push_str("\n\nRelevant context from earlier in this conversation:\n");
            system.push_str(&self.pending_context.join("\n\n"));
        }

        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(user_text));
        messages
    }

    pub async fn handle(&mut self, line: &str) -> Result<ChatReply> {
        match parse_input(line) {
            UserInput::Empty => Ok(ChatReply::Nothing),
            UserInput::Exit => {
                let snapshot = self.manager.end_session(&self.session_id).await?;
                Ok(ChatReply::Exit(snapshot))
            }
            UserInput::Recall(topic) => {
                let memories = self.manager.recall(&self.session_id, &topic, None).await?;
                for memory in &memories {
                    self.pending_context
                        .push(format!("Recalled memory ({}): {}", memory.title, memory.text));
                }
                Ok(ChatReply::Recalled(memories))
            }
            UserInput::Message(text) => self.send(&text).await,
        }
    }

    async fn send(&mut self, text: &str) -> Result<ChatReply> {
        let prompt = self.build_prompt(text);
        let reply = match self.generator.generate(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(session = %self.session_id, "Generator failed: {e}");
                return Ok(ChatReply::GeneratorFailed(e.to_string()));
            }
        };
        debug!(session = %self.session_id, chars = reply.len(), "Generator replied");

        self.pending_context.clear();
        self.history.push(ChatMessage::user(text));
        self.history.push(ChatMessage::assistant(reply.clone()));
        let keep = self.max_history_turns * 2;
        if self.history.len() > keep {
            self.history.drain(..self.history.len() - keep);
        }

        let report = self
            .manager
            .record_turn_with_prompt(&self.session_id, Some(text), &reply)
            .await?;
        if !report.reinjection.is_empty() {
            self.pending_context.push(report.reinjection.render());
        }

        Ok(ChatReply::Answer {
            text: reply,
            report,
        })
    }
}

/// Human-readable lines for a reply
pub fn render_reply(reply: &ChatReply) -> Vec<String> {
    match reply {
        ChatReply::Nothing => Vec::new(),
        ChatReply::Exit(snapshot) => vec![snapshot.summary_line()],
        ChatReply::GeneratorFailed(error) => vec![format!("Error: {error}")],
        ChatReply::Recalled(memories) if memories.is_empty() => {
            vec!["[memory] No relevant memories found.".to_string()]
        }
        ChatReply::Recalled(memories) => {
            let mut lines = vec![format!(
                "[memory] Recalled {} memories into context:",
                memories.len()
            )];
            lines.extend(
                memories
                    .iter()
                    .map(|m| format!("  - {} (score {:.2})", m.title, m.score)),
            );
            lines
        }
        ChatReply::Answer { text, report } => {
            let mut lines = vec![format!("Assistant: {text}")];
            match (report.stored_record(), report.filter_reason()) {
                (Some(record), _) => lines.push(format!(
                    "[memory] Stored #{} (grade {}/10, {:.1}x compression)",
                    record.id,
                    record.grade,
                    record.compression_ratio()
                )),
                (None, Some(reason)) => lines.push(format!("[memory] Skipped: {reason}")),
                (None, None) => {}
            }
            let block = &report.reinjection;
            if let (false, Some(trigger)) = (block.is_empty(), block.reason) {
                lines.push(format!(
                    "[memory] Reabsorbed {} memories ({trigger} trigger)",
                    block.record_ids.len()
                ));
            }
            lines
        }
    }
}

/// Read lines until `exit` or end of input.
///
/// End of input ends the session as if `exit` had been typed.
pub async fn run_repl<R, W>(
    conversation: &mut Conversation,
    reader: R,
    mut writer: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    writer
        .write_all(
            format!(
                "Session {} ready. Type 'recall <topic>' to search memories, 'exit' to quit.\n",
                conversation.session_id()
            )
            .as_bytes(),
        )
        .await?;

    loop {
        writer.write_all(b"You: ").await?;
        writer.flush().await?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => "exit".to_string(),
        };

        let reply = conversation.handle(&line).await?;
        for out in render_reply(&reply) {
            writer.write_all(out.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        if matches!(reply, ChatReply::Exit(_)) {
            writer.flush().await?;
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DeflateCodec;
    use crate::completion::ChatRole;
    use crate::config::{GraderConfig, MemoryConfig};
    use crate::grader::GraderAdapter;
    use crate::storage::InMemoryStore;
    use crate::testing::{MockGenerator, MockGrader, words};

    fn manager() -> Arc<MemoryManager> {
        let config = MemoryConfig {
            min_length_tokens: 5,
            interval_turns: 2,
            min_recall_score: 0.0,
            ..MemoryConfig::default()
        };
        let adapter =
            GraderAdapter::new(Arc::new(MockGrader::fixed(8)), &config, &GraderConfig::default());
        Arc::new(MemoryManager::new(
            config,
            Arc::new(DeflateCodec::default()),
            adapter,
            Arc::new(InMemoryStore::new()),
        ))
    }

    async fn conversation(generator: MockGenerator) -> Conversation {
        let manager = manager();
        let id = manager.start_session(None, None).await.unwrap();
        Conversation::new(manager, Arc::new(generator), id, "Be helpful.")
    }

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("  "), UserInput::Empty);
        assert_eq!(parse_input("exit"), UserInput::Exit);
        assert_eq!(parse_input("EXIT "), UserInput::Exit);
        assert_eq!(
            parse_input("recall ethics of AI"),
            UserInput::Recall("ethics of AI".to_string())
        );
        assert_eq!(
            parse_input("Recall   lasagna"),
            UserInput::Recall("lasagna".to_string())
        );
        assert_eq!(parse_input("recall"), UserInput::Message("recall".to_string()));
        assert_eq!(
            parse_input("recalling things"),
            UserInput::Message("recalling things".to_string())
        );
    }

    #[tokio::test]
    async fn test_message_is_generated_and_recorded() {
        let mut chat = conversation(MockGenerator::replies([words("answer", 10)])).await;
        let reply = chat.handle("what is rust").await.unwrap();

        match reply {
            ChatReply::Answer { report, .. } => {
                assert_eq!(report.turn, 1);
                assert!(report.stored_record().is_some());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generator_failure_is_not_stored() {
        let mut chat = conversation(MockGenerator::failing()).await;
        let reply = chat.handle("hello there").await.unwrap();
        assert!(matches!(reply, ChatReply::GeneratorFailed(_)));

        let snapshot = chat.manager.metrics(chat.session_id()).await.unwrap();
        assert_eq!(snapshot.turn_counter, 0);
        assert_eq!(snapshot.total_records, 0);
    }

    #[tokio::test]
    async fn test_reinjection_merges_into_next_prompt() {
        let generator = MockGenerator::replies([
            words("first", 10),
            words("second", 10),
            words("third", 10),
        ]);
        let prompts = generator.prompts();
        let mut chat = conversation(generator).await;

        chat.handle("one").await.unwrap();
        // interval of 2: turn 2 reinjects the oldest record
        chat.handle("two").await.unwrap();
        assert_eq!(chat.pending_context().len(), 1);
        chat.handle("three").await.unwrap();

        let prompts = prompts.lock().unwrap();
        let system = &prompts[2][0];
        assert_eq!(system.role, ChatRole::System);
        assert!(system.content.contains("first first"));
        assert!(chat.pending_context().is_empty());
    }

    #[tokio::test]
    async fn test_recall_stages_context() {
        let mut chat = conversation(MockGenerator::replies([
            words("ethics", 10),
            "ok".to_string(),
        ]))
        .await;
        chat.handle("tell me about ethics").await.unwrap();

        let reply = chat.handle("recall ethics").await.unwrap();
        match reply {
            ChatReply::Recalled(memories) => assert_eq!(memories.len(), 1),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(chat.pending_context().len(), 1);
        assert!(chat.build_prompt("next")[0].content.contains("Recalled memory"));
    }

    #[tokio::test]
    async fn test_repl_runs_until_exit() {
        let mut chat = conversation(MockGenerator::replies([words("reply", 10)])).await;
        let input = b"hello\n\nexit\n";
        let mut output = Vec::new();

        run_repl(&mut chat, &input[..], &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("Assistant: reply reply"));
        assert!(text.contains("[memory] Stored #1"));
        assert!(text.contains("1 stores"));
        assert!(!chat.manager.registry().contains(chat.session_id()));
    }
}
