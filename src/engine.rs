//! Per-conversation history engine wiring store, loader and policy to a
//! backend source.
//!
//! This module contains:
//! - `HistoryEngine`: the owned, instance-per-conversation engine
//! - `spawn_event_loop`: tokio driver applying source events on one task
//!
//! All mutations go through `handle_source_event` and the consumer-facing
//! methods on one engine instance; with the driver task as the single
//! writer there is no interleaving to lock against. Renderers on other
//! threads read via `snapshot()`.

use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::{
    AttachmentRecord, HistoryLoader, HistorySource, LoaderState, OrderedHistoryStore,
    PaginationPolicy, RecordKey, ScrollDirection, SourceEvent, StoreChange, Viewport,
};

/// The history synchronization engine for one conversation.
pub struct HistoryEngine<S: HistorySource> {
    conversation_id: u64,
    source: S,
    store: OrderedHistoryStore,
    loader: HistoryLoader,
    policy: PaginationPolicy,
    /// Bumped on truncation; in-flight buffers from an older generation
    /// are dropped when their batch completes
    generation: u64,
}

impl<S: HistorySource> HistoryEngine<S> {
    /// Open the backend channel and issue the initial page request.
    ///
    /// Returns the engine together with the receiving end of the source
    /// callback channel; feed its events to [`handle_source_event`]
    /// (or hand both to [`spawn_event_loop`]).
    ///
    /// [`handle_source_event`]: Self::handle_source_event
    pub fn open(
        source: S,
        conversation_id: u64,
    ) -> Result<(Self, UnboundedReceiver<SourceEvent>), String> {
        Self::open_with(
            source,
            conversation_id,
            HistoryLoader::new(),
            PaginationPolicy::new(),
        )
    }

    /// `open` with explicit page size and lookahead configuration.
    pub fn open_with(
        source: S,
        conversation_id: u64,
        loader: HistoryLoader,
        policy: PaginationPolicy,
    ) -> Result<(Self, UnboundedReceiver<SourceEvent>), String> {
        let (tx, rx) = unbounded_channel();
        if !source.open_history_source(conversation_id, tx) {
            return Err(format!(
                "Failed to open history source for conversation {}",
                conversation_id
            ));
        }

        let mut engine = Self {
            conversation_id,
            source,
            store: OrderedHistoryStore::new(),
            loader,
            policy,
            generation: 0,
        };

        // Fetch the first page straight away; consumers have nothing to
        // scroll until some history materializes
        engine.request_more();
        Ok((engine, rx))
    }

    /// Apply one backend callback.
    ///
    /// Page traffic goes through the loader; live events apply directly to
    /// the store regardless of loader state.
    pub fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Record(record) => {
                // History pages only materialize single-file attachments;
                // anything else is skipped at load time
                if record.attached_files.len() == 1 {
                    self.loader.on_record(record);
                } else {
                    debug!(
                        "Skipping page record with {} files",
                        record.attached_files.len()
                    );
                }
            }
            SourceEvent::EndOfBatch => {
                if let Some(batch) = self.loader.on_end_of_batch(self.generation) {
                    let added = self.store.merge_batch(batch.records);
                    debug!(
                        "Merged page of {} new records ({:?}, loader now {:?})",
                        added,
                        batch.source_state,
                        self.loader.state()
                    );
                }
            }
            SourceEvent::LiveInsert(record) => {
                self.store.apply_live_insert(record);
            }
            SourceEvent::LiveDelete(id) => {
                self.store.apply_delete_raw(id);
            }
            SourceEvent::Truncate => {
                self.generation += 1;
                self.store.apply_truncate();
                // A cleared history says nothing about what the backend may
                // still hold; a non-loading loader starts over. An in-flight
                // request keeps running and its batch is dropped as stale.
                if !self.loader.is_loading() {
                    self.loader.reset();
                }
            }
        }
    }

    /// Report the consumer's viewport; requests another page when the
    /// pagination policy fires.
    pub fn notify_viewport(&mut self, leading_position: usize, direction: ScrollDirection) {
        let viewport = Viewport {
            leading_position,
            direction,
        };
        if self
            .policy
            .should_request(viewport, self.store.count(), &self.loader)
        {
            self.request_more();
        }
    }

    /// Request another page of older history, if the loader permits.
    pub fn request_more(&mut self) -> bool {
        self.loader
            .request_more(&self.source, self.conversation_id, self.generation)
    }

    /// Subscribe to store change notifications
    pub fn subscribe(&mut self) -> UnboundedReceiver<StoreChange> {
        self.store.subscribe()
    }

    pub fn count(&self) -> usize {
        self.store.count()
    }

    pub fn record_at(&self, position: usize) -> Option<&AttachmentRecord> {
        self.store.record_at(position)
    }

    pub fn find(&self, key: RecordKey) -> Option<&AttachmentRecord> {
        self.store.find(key)
    }

    /// Owned copy of the materialized history, safe for other threads
    pub fn snapshot(&self) -> Vec<AttachmentRecord> {
        self.store.snapshot()
    }

    pub fn state(&self) -> LoaderState {
        self.loader.state()
    }

    pub fn has_more(&self) -> bool {
        self.loader.has_more()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Tear down the backend channel
    pub fn close(self) {
        self.source.close_history_source(self.conversation_id);
    }
}

/// Drive an engine from its source callback channel on one tokio task.
///
/// The task is the engine's single writer; consumers on other threads read
/// through the shared handle (`snapshot`, `count`, `notify_viewport`).
/// The task ends when the source drops its sender side, i.e. when the
/// conversation's channel closes.
pub fn spawn_event_loop<S>(
    engine: Arc<Mutex<HistoryEngine<S>>>,
    mut events: UnboundedReceiver<SourceEvent>,
) -> JoinHandle<()>
where
    S: HistorySource + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            engine.lock().await.handle_source_event(event);
        }
        debug!("History source channel closed; event loop ending");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc::UnboundedSender;

    use crate::{AttachedFile, ChangeKind, HistorySourceState, RecordStatus};

    /// In-memory source streaming scripted pages through the listener
    /// channel, exactly as the backend would: per-record callbacks followed
    /// by the end-of-batch sentinel.
    struct ScriptedSource {
        pages: StdMutex<VecDeque<(Vec<AttachmentRecord>, HistorySourceState)>>,
        listener: StdMutex<Option<UnboundedSender<SourceEvent>>>,
        requests: StdMutex<usize>,
        open_ok: bool,
    }

    impl ScriptedSource {
        fn new(pages: Vec<(Vec<AttachmentRecord>, HistorySourceState)>) -> Self {
            Self {
                pages: StdMutex::new(pages.into()),
                listener: StdMutex::new(None),
                requests: StdMutex::new(0),
                open_ok: true,
            }
        }

        fn failing() -> Self {
            let mut source = Self::new(Vec::new());
            source.open_ok = false;
            source
        }

        fn requests(&self) -> usize {
            *self.requests.lock().unwrap()
        }

        fn send(&self, event: SourceEvent) {
            let listener = self.listener.lock().unwrap();
            listener.as_ref().unwrap().send(event).unwrap();
        }
    }

    impl HistorySource for ScriptedSource {
        fn open_history_source(
            &self,
            _: u64,
            listener: UnboundedSender<SourceEvent>,
        ) -> bool {
            if self.open_ok {
                *self.listener.lock().unwrap() = Some(listener);
            }
            self.open_ok
        }

        fn request_page(&self, _: u64, _: usize) -> HistorySourceState {
            *self.requests.lock().unwrap() += 1;
            let (records, state) = self
                .pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((Vec::new(), HistorySourceState::NoMore));
            for record in records {
                self.send(SourceEvent::Record(record));
            }
            self.send(SourceEvent::EndOfBatch);
            state
        }

        fn close_history_source(&self, _: u64) {}
    }

    fn file(handle: u64) -> AttachedFile {
        AttachedFile {
            name: format!("file-{}.bin", handle),
            size: 1024,
            handle,
        }
    }

    fn page(range: std::ops::RangeInclusive<i64>) -> Vec<AttachmentRecord> {
        range
            .rev()
            .map(|index| {
                AttachmentRecord::sent(index as u64, index).with_files(vec![file(index as u64)])
            })
            .collect()
    }

    fn drain(
        engine: &mut HistoryEngine<ScriptedSource>,
        rx: &mut UnboundedReceiver<SourceEvent>,
    ) {
        while let Ok(event) = rx.try_recv() {
            engine.handle_source_event(event);
        }
    }

    #[test]
    fn test_open_failure_is_an_error() {
        assert!(HistoryEngine::open(ScriptedSource::failing(), 1).is_err());
    }

    #[test]
    fn test_two_page_scroll_scenario() {
        // Page of 20 (indices 100..81, HasMore), then 20 more (80..61, NoMore)
        let source = ScriptedSource::new(vec![
            (page(81..=100), HistorySourceState::HasMore),
            (page(61..=80), HistorySourceState::NoMore),
        ]);

        let (mut engine, mut rx) = HistoryEngine::open(source, 1).unwrap();
        drain(&mut engine, &mut rx);
        assert_eq!(engine.count(), 20);
        assert_eq!(engine.state(), LoaderState::Idle);
        assert!(engine.has_more());

        // Scrolling toward older history, still outside the lookahead
        engine.notify_viewport(5, ScrollDirection::Older);
        assert_eq!(engine.source.requests(), 1);

        // Viewport nears index 88 (position 12, 7 records from the oldest)
        engine.notify_viewport(12, ScrollDirection::Older);
        assert_eq!(engine.source.requests(), 2);
        drain(&mut engine, &mut rx);

        assert_eq!(engine.count(), 40);
        assert_eq!(engine.state(), LoaderState::Exhausted);
        assert!(!engine.has_more());

        // Descending, gap-free: positions 0..39 hold indices 100..61
        for position in 0..40 {
            assert_eq!(
                engine.record_at(position).unwrap().message_index,
                100 - position as i64
            );
        }

        // Exhausted is absorbing for the session
        engine.notify_viewport(39, ScrollDirection::Older);
        assert_eq!(engine.source.requests(), 2);
    }

    #[test]
    fn test_live_events_interleave_with_page() {
        let source = ScriptedSource::new(vec![(page(81..=100), HistorySourceState::HasMore)]);
        let (mut engine, mut rx) = HistoryEngine::open(source, 1).unwrap();

        // Process page records, then a live insert racing ahead of the
        // sentinel, then the sentinel itself
        for _ in 0..20 {
            let event = rx.try_recv().unwrap();
            engine.handle_source_event(event);
        }
        engine.handle_source_event(SourceEvent::LiveInsert(AttachmentRecord::sent(101, 101)));
        assert_eq!(engine.count(), 1);

        engine.handle_source_event(rx.try_recv().unwrap());
        assert_eq!(engine.count(), 21);
        assert_eq!(engine.record_at(0).unwrap().message_index, 101);
        assert_eq!(engine.record_at(20).unwrap().message_index, 81);
    }

    #[test]
    fn test_live_duplicate_shrinks_merged_page_without_exhausting() {
        let source = ScriptedSource::new(vec![(page(81..=100), HistorySourceState::HasMore)]);
        let (mut engine, mut rx) = HistoryEngine::open(source, 1).unwrap();

        // A record from the in-flight page also arrives as a live event
        engine.handle_source_event(SourceEvent::LiveInsert(AttachmentRecord::sent(95, 95)));
        drain(&mut engine, &mut rx);

        // Deduplicated, still ordered, and not mistaken for end-of-history
        assert_eq!(engine.count(), 20);
        assert_eq!(engine.state(), LoaderState::Idle);
        assert!(engine.has_more());
    }

    #[test]
    fn test_truncate_while_loading_drops_stale_batch() {
        let source = ScriptedSource::new(vec![
            (page(81..=100), HistorySourceState::HasMore),
            (page(61..=80), HistorySourceState::HasMore),
        ]);
        let (mut engine, mut rx) = HistoryEngine::open(source, 1).unwrap();
        drain(&mut engine, &mut rx);
        assert_eq!(engine.count(), 20);

        engine.request_more();
        // Records of page two are queued; truncation lands before them
        engine.handle_source_event(SourceEvent::Truncate);
        assert_eq!(engine.count(), 0);
        assert_eq!(engine.generation(), 1);

        drain(&mut engine, &mut rx);
        // The stale batch was begun before the truncation point: dropped
        assert_eq!(engine.count(), 0);
        assert_eq!(engine.state(), LoaderState::Idle);
        assert!(engine.has_more());
    }

    #[test]
    fn test_truncate_reopens_exhausted_history() {
        let source = ScriptedSource::new(vec![
            (page(81..=100), HistorySourceState::NoMore),
            (Vec::new(), HistorySourceState::NoMore),
        ]);
        let (mut engine, mut rx) = HistoryEngine::open(source, 1).unwrap();
        drain(&mut engine, &mut rx);
        assert_eq!(engine.state(), LoaderState::Exhausted);

        engine.handle_source_event(SourceEvent::Truncate);
        assert_eq!(engine.count(), 0);
        assert_eq!(engine.state(), LoaderState::Idle);
        assert!(engine.request_more());
    }

    #[test]
    fn test_delete_for_truncated_record_is_harmless() {
        let source = ScriptedSource::new(vec![(page(81..=100), HistorySourceState::HasMore)]);
        let (mut engine, mut rx) = HistoryEngine::open(source, 1).unwrap();
        drain(&mut engine, &mut rx);

        engine.handle_source_event(SourceEvent::Truncate);
        // The deletion raced the truncation that already evicted everything
        engine.handle_source_event(SourceEvent::LiveDelete(95));
        assert_eq!(engine.count(), 0);
    }

    #[test]
    fn test_temp_to_final_transition_through_live_events() {
        let source = ScriptedSource::new(vec![(Vec::new(), HistorySourceState::NoMore)]);
        let (mut engine, mut rx) = HistoryEngine::open(source, 1).unwrap();
        drain(&mut engine, &mut rx);

        let sending = AttachmentRecord::sending(7, 101).with_files(vec![AttachedFile {
            name: "photo.jpg".into(),
            size: 4096,
            handle: 555,
        }]);
        engine.handle_source_event(SourceEvent::LiveInsert(sending));

        let mut committed = AttachmentRecord::sent(42, 101);
        committed.temp_id = Some(7);
        engine.handle_source_event(SourceEvent::LiveInsert(committed));

        assert_eq!(engine.count(), 1);
        assert_eq!(
            engine.find(RecordKey::Message(42)).unwrap().status,
            RecordStatus::Sent
        );

        // And the backend may later delete it by the temp handle
        engine.handle_source_event(SourceEvent::LiveDelete(7));
        assert_eq!(engine.count(), 0);
    }

    #[test]
    fn test_multi_file_page_records_are_skipped() {
        let files = vec![
            AttachedFile {
                name: "a.png".into(),
                size: 1,
                handle: 1,
            },
            AttachedFile {
                name: "b.png".into(),
                size: 2,
                handle: 2,
            },
        ];
        let multi = AttachmentRecord::sent(90, 90).with_files(files.clone());
        let single = AttachmentRecord::sent(91, 91).with_files(vec![file(91)]);
        let source = ScriptedSource::new(vec![(vec![single, multi], HistorySourceState::NoMore)]);
        let (mut engine, mut rx) = HistoryEngine::open(source, 1).unwrap();
        drain(&mut engine, &mut rx);

        // The multi-file record never reached the page buffer, but the same
        // record as a live event is not filtered
        assert_eq!(engine.count(), 1);
        engine.handle_source_event(SourceEvent::LiveInsert(
            AttachmentRecord::sent(90, 90).with_files(files),
        ));
        assert_eq!(engine.count(), 2);
    }

    #[test]
    fn test_change_notifications_reach_subscriber() {
        let source = ScriptedSource::new(vec![(page(81..=100), HistorySourceState::HasMore)]);
        let (mut engine, mut rx) = HistoryEngine::open(source, 1).unwrap();
        let mut changes = engine.subscribe();
        drain(&mut engine, &mut rx);

        let change = changes.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::BatchPrepended);
        assert_eq!(change.count, 20);

        engine.handle_source_event(SourceEvent::LiveDelete(95));
        let change = changes.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::Removed);

        engine.handle_source_event(SourceEvent::Truncate);
        let change = changes.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::Cleared);
        assert_eq!(change.count, 19);
    }

    #[tokio::test]
    async fn test_event_loop_drives_engine() {
        let source = ScriptedSource::new(vec![(page(81..=100), HistorySourceState::NoMore)]);
        let (engine, rx) = HistoryEngine::open(source, 1).unwrap();
        let engine = Arc::new(Mutex::new(engine));

        let driver = spawn_event_loop(engine.clone(), rx);

        // Wait for the page to be applied by the driver task
        loop {
            {
                let engine = engine.lock().await;
                if engine.state() == LoaderState::Exhausted {
                    assert_eq!(engine.count(), 20);
                    let snapshot = engine.snapshot();
                    assert_eq!(snapshot[0].message_index, 100);
                    assert_eq!(snapshot[19].message_index, 81);
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        // Closing the source's sender side ends the loop
        *engine.lock().await.source.listener.lock().unwrap() = None;
        driver.await.unwrap();
    }
}
