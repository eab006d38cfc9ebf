//! Reassembly of streamed character responses.
//!
//! A response arrives as `stream_start`, any number of `stream_data` chunks and
//! a `stream_end`. At most one stream is open per conversation; chunks are
//! appended in arrival order and only to the stream they name.

use storyweave_shared::{CharacterRef, Message};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Open,
    Closed,
    Errored,
}

/// One in-flight streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    pub stream_id: String,
    pub character: CharacterRef,
    pub buffered_content: String,
    pub status: StreamStatus,
}

impl StreamSession {
    fn finalize(mut self, status: StreamStatus) -> (Message, Self) {
        self.status = status;
        let message = Message::from_character(self.character.clone(), self.buffered_content.clone());
        (message, self)
    }
}

/// Result of finalizing a stream that the transport cut short.
#[derive(Debug, Clone, PartialEq)]
pub struct Interrupted {
    pub session: StreamSession,
    /// `None` when nothing had been buffered yet.
    pub message: Option<Message>,
}

impl Interrupted {
    pub fn error(&self) -> EngineError {
        EngineError::StreamInterrupted {
            stream_id: self.session.stream_id.clone(),
            buffered: self.session.buffered_content.len(),
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamAssembler {
    open: Option<StreamSession>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_session(&self) -> Option<&StreamSession> {
        self.open.as_ref()
    }

    pub fn open_stream(&mut self, stream_id: &str, character: CharacterRef) -> EngineResult<()> {
        if let Some(open) = &self.open {
            let err = EngineError::DuplicateStream {
                open: open.stream_id.clone(),
                rejected: stream_id.to_string(),
            };
            crate::log_warn!("StreamAssembler: {}", err);
            return Err(err);
        }
        crate::log_debug!("StreamAssembler: open '{}' for {}", stream_id, character);
        self.open = Some(StreamSession {
            stream_id: stream_id.to_string(),
            character,
            buffered_content: String::new(),
            status: StreamStatus::Open,
        });
        Ok(())
    }

    /// Append a chunk to the open stream. A chunk for any other stream is
    /// dropped and reported.
    pub fn append_chunk(&mut self, stream_id: &str, text: &str) -> EngineResult<()> {
        match self.open.as_mut() {
            Some(session) if session.stream_id == stream_id => {
                session.buffered_content.push_str(text);
                Ok(())
            }
            _ => {
                crate::log_warn!(
                    "StreamAssembler: dropping {} byte chunk for unknown stream '{}'",
                    text.len(),
                    stream_id
                );
                Err(EngineError::UnknownStream(stream_id.to_string()))
            }
        }
    }

    pub fn close_stream(&mut self, stream_id: &str) -> EngineResult<Message> {
        match self.open.take() {
            Some(session) if session.stream_id == stream_id => {
                let (message, _) = session.finalize(StreamStatus::Closed);
                Ok(message)
            }
            other => {
                self.open = other;
                crate::log_warn!("StreamAssembler: close for unknown stream '{}'", stream_id);
                Err(EngineError::UnknownStream(stream_id.to_string()))
            }
        }
    }

    /// Finalize the open stream as errored, keeping whatever was buffered.
    pub fn interrupt(&mut self) -> Option<Interrupted> {
        let session = self.open.take()?;
        let keep = !session.buffered_content.is_empty();
        let (message, session) = session.finalize(StreamStatus::Errored);
        crate::log_warn!(
            "StreamAssembler: stream '{}' interrupted with {} bytes buffered",
            session.stream_id,
            session.buffered_content.len()
        );
        Some(Interrupted {
            session,
            message: keep.then_some(message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyweave_shared::Speaker;

    fn nova() -> CharacterRef {
        CharacterRef::new("Nova")
    }

    #[test]
    fn chunks_concatenate_in_call_order() {
        let mut assembler = StreamAssembler::new();
        assembler.open_stream("s1", nova()).unwrap();
        assembler.append_chunk("s1", "Hel").unwrap();
        assembler.append_chunk("s1", "lo!").unwrap();

        let message = assembler.close_stream("s1").unwrap();
        assert_eq!(message.content, "Hello!");
        assert_eq!(message.speaker, Speaker::Character);
        assert_eq!(message.speaker_name(), "Nova");
        assert!(assembler.open_session().is_none());
    }

    #[test]
    fn many_chunks_keep_order() {
        let chunks: Vec<String> = (0..50).map(|i| format!("{i},")).collect();
        let mut assembler = StreamAssembler::new();
        assembler.open_stream("s", nova()).unwrap();
        for chunk in &chunks {
            assembler.append_chunk("s", chunk).unwrap();
        }
        assert_eq!(assembler.close_stream("s").unwrap().content, chunks.concat());
    }

    #[test]
    fn second_open_is_rejected() {
        let mut assembler = StreamAssembler::new();
        assembler.open_stream("s1", nova()).unwrap();
        let err = assembler
            .open_stream("s2", CharacterRef::new("Iris"))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::DuplicateStream {
                open: "s1".into(),
                rejected: "s2".into()
            }
        );
        assert_eq!(assembler.open_session().unwrap().stream_id, "s1");
    }

    #[test]
    fn foreign_chunk_is_never_merged() {
        let mut assembler = StreamAssembler::new();
        assembler.open_stream("s1", nova()).unwrap();
        assembler.append_chunk("s1", "a").unwrap();
        assert!(assembler.append_chunk("other", "X").is_err());
        assert!(assembler.close_stream("other").is_err());
        assert_eq!(assembler.close_stream("s1").unwrap().content, "a");
    }

    #[test]
    fn chunk_without_open_stream_is_dropped() {
        let mut assembler = StreamAssembler::new();
        assert_eq!(
            assembler.append_chunk("s1", "x"),
            Err(EngineError::UnknownStream("s1".into()))
        );
    }

    #[test]
    fn interrupt_keeps_partial_content() {
        let mut assembler = StreamAssembler::new();
        assembler.open_stream("s1", nova()).unwrap();
        assembler.append_chunk("s1", "Hel").unwrap();

        let interrupted = assembler.interrupt().unwrap();
        assert_eq!(interrupted.session.status, StreamStatus::Errored);
        assert_eq!(interrupted.session.stream_id, "s1");
        assert_eq!(interrupted.message.unwrap().content, "Hel");
        assert!(assembler.interrupt().is_none());
        assembler.open_stream("s2", nova()).unwrap();
    }

    #[test]
    fn interrupt_of_empty_stream_yields_no_message() {
        let mut assembler = StreamAssembler::new();
        assembler.open_stream("s1", nova()).unwrap();
        let interrupted = assembler.interrupt().unwrap();
        assert!(interrupted.message.is_none());
        assert_eq!(
            interrupted.error(),
            EngineError::StreamInterrupted {
                stream_id: "s1".into(),
                buffered: 0
            }
        );
    }
}
