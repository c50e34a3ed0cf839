//! Per-session mailbox worker.
//!
//! Each session owns exactly one worker task, which owns the conversation.
//! Commands are handled one at a time in arrival order, so two messages
//! posted back to back never run their loops concurrently. The worker exits
//! once every mailbox sender is gone, after finishing whatever it is doing.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::agent::AgentLoop;
use crate::events::{Event, EventSink, Level};
use crate::model::{ChatModel, ChatSession, ToolDeclaration};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Message(String),
    Reset,
}

pub(crate) struct Worker {
    pub session_id: String,
    pub model: Arc<dyn ChatModel>,
    pub agent: AgentLoop,
    pub declarations: Arc<[ToolDeclaration]>,
    pub sink: EventSink,
}

impl Worker {
    pub fn spawn(self, mailbox: mpsc::UnboundedReceiver<Command>) -> tokio::task::JoinHandle<()> {
        let span = tracing::info_span!("hubbub.session.worker", session_id = %self.session_id);
        tokio::spawn(self.run(mailbox).instrument(span))
    }

    async fn run(self, mut mailbox: mpsc::UnboundedReceiver<Command>) {
        let mut chat: Box<dyn ChatSession> = self.model.start_chat();

        while let Some(command) = mailbox.recv().await {
            match command {
                Command::Message(text) => {
                    self.agent
                        .process(chat.as_mut(), &self.declarations, &text, &self.sink)
                        .await;
                }
                Command::Reset => {
                    chat = self.model.start_chat();
                    tracing::info!("conversation reset");
                    self.sink.emit(Event::status(Level::Info, "Session reset"));
                }
            }
        }

        tracing::debug!("mailbox closed, worker exiting");
    }
}
