//! Ordered presentation of dialogue units.
//!
//! Units are drained strictly FIFO and one at a time: the next unit never
//! starts before the current one has finished or been cancelled. Character
//! text is revealed one `char` per tick; the reveal is a cancellable task that
//! a [`PresentationQueue::clear`] aborts. A character's typing placeholder is
//! always taken down before that character's message starts, and there is at
//! most one placeholder per character.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use storyweave_shared::{CharacterRef, Message, MessageKind, Speaker};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum PresentationUnit {
    Message(Message),
    /// Message replayed from persisted history; shown at once, no reveal.
    Restored(Message),
    /// "Character is typing" placeholder.
    Typing(CharacterRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationOutcome {
    Completed,
    Cancelled,
}

/// Whatever draws the dialogue. Calls arrive from the drain task, never
/// concurrently for one queue.
pub trait RenderTarget: Send + Sync {
    fn show_typing(&self, character: &CharacterRef);
    fn hide_typing(&self, character: &CharacterRef);
    fn begin_message(&self, message: &Message);
    /// Append revealed text to the message started by `begin_message`.
    fn append_text(&self, message: &Message, text: &str);
    fn end_message(&self, message: &Message, outcome: PresentationOutcome);
}

#[derive(Default)]
struct QueueState {
    units: VecDeque<PresentationUnit>,
    visible_typing: HashSet<CharacterRef>,
    current: Option<CancellationToken>,
}

pub struct PresentationQueue {
    target: Arc<dyn RenderTarget>,
    reveal_interval: Duration,
    state: Mutex<QueueState>,
    presenting: tokio::sync::Mutex<()>,
    wake: Notify,
}

impl PresentationQueue {
    pub fn new(target: Arc<dyn RenderTarget>, reveal_interval: Duration) -> Self {
        Self {
            target,
            reveal_interval,
            state: Mutex::new(QueueState::default()),
            presenting: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enqueue(&self, unit: PresentationUnit) {
        {
            let mut state = self.lock();
            if let PresentationUnit::Typing(character) = &unit {
                let queued = state
                    .units
                    .iter()
                    .any(|u| matches!(u, PresentationUnit::Typing(c) if c == character));
                if queued || state.visible_typing.contains(character) {
                    crate::log_debug!("PresentationQueue: {} already has a placeholder", character);
                    return;
                }
            }
            state.units.push_back(unit);
        }
        self.wake.notify_one();
    }

    /// Drop queued units, cancel the running reveal and take down every
    /// placeholder.
    pub fn clear(&self) {
        let hidden: Vec<CharacterRef> = {
            let mut state = self.lock();
            state.units.clear();
            if let Some(token) = state.current.take() {
                token.cancel();
            }
            state.visible_typing.drain().collect()
        };
        for character in &hidden {
            self.target.hide_typing(character);
        }
        crate::log_debug!("PresentationQueue: cleared ({} placeholders removed)", hidden.len());
    }

    /// Remove a character's placeholder, queued or visible. Used when the real
    /// response starts streaming.
    pub fn dismiss_typing(&self, character: &CharacterRef) {
        let visible = {
            let mut state = self.lock();
            state
                .units
                .retain(|u| !matches!(u, PresentationUnit::Typing(c) if c == character));
            state.visible_typing.remove(character)
        };
        if visible {
            self.target.hide_typing(character);
        }
    }

    /// Present the next unit and wait for it to finish. Returns `None` when
    /// the queue is empty.
    pub async fn drain_next(&self) -> Option<PresentationOutcome> {
        let _presenting = self.presenting.lock().await;

        let (unit, token) = {
            let mut state = self.lock();
            let unit = state.units.pop_front()?;
            let token = CancellationToken::new();
            state.current = Some(token.clone());
            (unit, token)
        };

        let outcome = match unit {
            PresentationUnit::Typing(character) => {
                self.lock().visible_typing.insert(character.clone());
                self.target.show_typing(&character);
                PresentationOutcome::Completed
            }
            PresentationUnit::Message(message) => self.present(&message, &token, true).await,
            PresentationUnit::Restored(message) => self.present(&message, &token, false).await,
        };

        self.lock().current = None;
        Some(outcome)
    }

    /// Drain until the queue is empty.
    pub async fn drain(&self) {
        while self.drain_next().await.is_some() {}
    }

    /// Run the drain loop in the background, waking on every enqueue.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                queue.drain().await;
                queue.wake.notified().await;
            }
        })
    }

    async fn present(
        &self,
        message: &Message,
        token: &CancellationToken,
        allow_reveal: bool,
    ) -> PresentationOutcome {
        if let Some(character) = message.character_ref.as_ref() {
            if message.speaker == Speaker::Character {
                let visible = self.lock().visible_typing.remove(character);
                if visible {
                    self.target.hide_typing(character);
                }
            }
        }

        self.target.begin_message(message);
        let reveal = allow_reveal
            && message.speaker == Speaker::Character
            && message.kind == MessageKind::Text
            && !self.reveal_interval.is_zero();

        let outcome = if reveal {
            self.reveal(message, token).await
        } else {
            self.target.append_text(message, &message.content);
            PresentationOutcome::Completed
        };
        self.target.end_message(message, outcome);
        outcome
    }

    async fn reveal(&self, message: &Message, token: &CancellationToken) -> PresentationOutcome {
        let mut buf = [0u8; 4];
        for ch in message.content.chars() {
            tokio::select! {
                biased;
                _ = token.cancelled() => return PresentationOutcome::Cancelled,
                _ = tokio::time::sleep(self.reveal_interval) => {}
            }
            self.target.append_text(message, ch.encode_utf8(&mut buf));
        }
        PresentationOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        ShowTyping(String),
        HideTyping(String),
        Begin(String),
        Text(String),
        End(String, PresentationOutcome),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(Instant, Event)>>,
    }

    impl Recorder {
        fn push(&self, event: Event) {
            self.events.lock().unwrap().push((Instant::now(), event));
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().iter().map(|(_, e)| e.clone()).collect()
        }

        fn revealed(&self) -> String {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Text(t) => Some(t),
                    _ => None,
                })
                .collect()
        }
    }

    impl RenderTarget for Recorder {
        fn show_typing(&self, character: &CharacterRef) {
            self.push(Event::ShowTyping(character.to_string()));
        }
        fn hide_typing(&self, character: &CharacterRef) {
            self.push(Event::HideTyping(character.to_string()));
        }
        fn begin_message(&self, message: &Message) {
            self.push(Event::Begin(message.content.clone()));
        }
        fn append_text(&self, _message: &Message, text: &str) {
            self.push(Event::Text(text.to_string()));
        }
        fn end_message(&self, message: &Message, outcome: PresentationOutcome) {
            self.push(Event::End(message.content.clone(), outcome));
        }
    }

    fn queue(recorder: &Arc<Recorder>) -> Arc<PresentationQueue> {
        Arc::new(PresentationQueue::new(
            recorder.clone(),
            Duration::from_millis(30),
        ))
    }

    fn nova(text: &str) -> Message {
        Message::from_character(CharacterRef::new("Nova"), text)
    }

    #[tokio::test(start_paused = true)]
    async fn reveal_takes_one_interval_per_char() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.enqueue(PresentationUnit::Message(nova("Hi!")));

        let start = Instant::now();
        assert_eq!(queue.drain_next().await, Some(PresentationOutcome::Completed));
        assert_eq!(start.elapsed(), Duration::from_millis(90));
        assert_eq!(recorder.revealed(), "Hi!");
        assert_eq!(queue.drain_next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn units_never_overlap() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.enqueue(PresentationUnit::Message(nova("one")));
        queue.enqueue(PresentationUnit::Message(Message::from_user("two")));
        queue.enqueue(PresentationUnit::Message(nova("three")));

        // Two drainers racing must still present strictly one at a time.
        let a = tokio::spawn({
            let q = queue.clone();
            async move { q.drain().await }
        });
        let b = tokio::spawn({
            let q = queue.clone();
            async move { q.drain().await }
        });
        a.await.unwrap();
        b.await.unwrap();

        let mut open: Option<String> = None;
        let mut order = Vec::new();
        for event in recorder.events() {
            match event {
                Event::Begin(content) => {
                    assert!(open.is_none(), "{content} started while {open:?} was running");
                    open = Some(content.clone());
                    order.push(content);
                }
                Event::End(content, _) => {
                    assert_eq!(open.take(), Some(content));
                }
                _ => {}
            }
        }
        assert_eq!(order, vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_running_reveal_and_drops_queue() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.enqueue(PresentationUnit::Message(nova("abcdefghij")));
        queue.enqueue(PresentationUnit::Message(nova("never shown")));

        let runner = tokio::spawn({
            let q = queue.clone();
            async move { q.drain_next().await }
        });
        tokio::time::sleep(Duration::from_millis(95)).await;
        queue.clear();

        assert_eq!(runner.await.unwrap(), Some(PresentationOutcome::Cancelled));
        assert_eq!(recorder.revealed(), "abc");
        assert!(queue.is_empty());
        assert!(!recorder
            .events()
            .contains(&Event::Begin("never shown".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn placeholder_removed_before_real_message() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.enqueue(PresentationUnit::Typing(CharacterRef::new("Nova")));
        queue.enqueue(PresentationUnit::Typing(CharacterRef::new("Nova")));
        queue.enqueue(PresentationUnit::Message(nova("ok")));
        queue.drain().await;

        let events = recorder.events();
        assert_eq!(
            &events[..3],
            &[
                Event::ShowTyping("Nova".into()),
                Event::HideTyping("Nova".into()),
                Event::Begin("ok".into()),
            ]
        );
        let shows = events
            .iter()
            .filter(|e| matches!(e, Event::ShowTyping(_)))
            .count();
        assert_eq!(shows, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dismiss_typing_hides_visible_placeholder() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.enqueue(PresentationUnit::Typing(CharacterRef::new("Nova")));
        queue.drain().await;

        queue.dismiss_typing(&CharacterRef::new("Nova"));
        queue.dismiss_typing(&CharacterRef::new("Nova"));
        assert_eq!(
            recorder.events(),
            vec![
                Event::ShowTyping("Nova".into()),
                Event::HideTyping("Nova".into())
            ]
        );

        // A new placeholder is allowed once the old one is gone.
        queue.enqueue(PresentationUnit::Typing(CharacterRef::new("Nova")));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn user_messages_show_at_once() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.enqueue(PresentationUnit::Message(Message::from_user("hello there")));

        let start = Instant::now();
        queue.drain().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(recorder.revealed(), "hello there");
    }

    #[tokio::test(start_paused = true)]
    async fn restored_history_is_not_revealed() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.enqueue(PresentationUnit::Restored(nova("from before")));

        let start = Instant::now();
        queue.drain().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(recorder.revealed(), "from before");
    }

    #[tokio::test(start_paused = true)]
    async fn background_loop_drains_new_units() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        let handle = queue.spawn();

        queue.enqueue(PresentationUnit::Message(nova("yo")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.revealed(), "yo");
        handle.abort();
    }
}
