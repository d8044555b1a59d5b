//! one in-flight recommendation request, end to end.
//!
//! [`run_request`] drives transport + decoder and reports [`StreamSignal`]s, always ending
//! with exactly one `Complete`. [`Orchestrator`] folds those signals into the accumulated
//! text and a freshly re-parsed [`ParsedDocument`], dropping signals from superseded requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bevy::log::{debug, error, info};
use flume::{Receiver, Sender};
use futures_lite::future;

use crate::config::DiveConfig;
use crate::decoder::{ChunkSource, StreamDecoder};
use crate::error::{ErrorKind, RequestError};
use crate::prompt::RequestKind;
use crate::sections::{ParsedDocument, parse_document};
use crate::transport::ChatTransport;

/// raw progress of one request, as produced by [`run_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// success status received; body streaming starts
    Opened,
    Delta(String),
    Error(RequestError),
    /// always last, exactly once, on every path
    Complete,
}

/// shared flag telling a running request to stop reading and release its body.
///
/// cancelling also wakes anyone awaiting [`CancelToken::cancelled`]: the token holds the
/// only sender of a never-used channel, and dropping it disconnects every receiver.
#[derive(Debug, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl Default for CancelToken {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal: rx,
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        self.trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
    /// resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // nothing is ever sent; this only returns on disconnect
        let _ = self.signal.recv_async().await;
    }
}

/// issue one request and report its progress through `emit`.
pub async fn run_request(
    transport: &dyn ChatTransport,
    config: &DiveConfig,
    kind: &RequestKind,
    cancel: &CancelToken,
    mut emit: impl FnMut(StreamSignal),
) {
    if !config.has_credentials() {
        error!(target: "bevy_dive_buddy", "no api key configured; not sending request");
        emit(StreamSignal::Error(RequestError::missing_credentials()));
        emit(StreamSignal::Complete);
        return;
    }

    let body = kind.to_request(config.model_or_default());
    let url = config.chat_completions_url();

    match transport.open(&url, &config.api_key, &body).await {
        Err(err) => {
            error!(target: "bevy_dive_buddy", "request failed: {}", err);
            emit(StreamSignal::Error(err));
        }
        Ok(mut source) => {
            emit(StreamSignal::Opened);
            let pumped = pump(source.as_mut(), cancel, &mut emit).await;
            // released on every path, including cancellation and read errors
            source.close().await;
            if let Err(err) = pumped {
                error!(target: "bevy_dive_buddy", "stream failed: {}", err);
                emit(StreamSignal::Error(err));
            }
        }
    }

    emit(StreamSignal::Complete);
}

async fn pump<S: ChunkSource + ?Sized>(
    source: &mut S,
    cancel: &CancelToken,
    emit: &mut impl FnMut(StreamSignal),
) -> Result<(), RequestError> {
    let mut decoder = StreamDecoder::new();
    let mut chunks = 0usize;
    loop {
        if cancel.is_cancelled() {
            debug!(target: "bevy_dive_buddy", "request superseded after {} chunks", chunks);
            return Ok(());
        }
        // a stalled body must not outlive cancellation
        let next = future::or(async { Some(source.next_chunk().await) }, async {
            cancel.cancelled().await;
            None
        })
        .await;
        let Some(next) = next else {
            debug!(target: "bevy_dive_buddy", "request cancelled while waiting for chunk {}", chunks + 1);
            return Ok(());
        };
        match next? {
            Some(bytes) => {
                chunks += 1;
                for delta in decoder.feed(&bytes) {
                    emit(StreamSignal::Delta(delta));
                }
                if decoder.is_done() {
                    return Ok(());
                }
            }
            None => {
                for delta in decoder.flush() {
                    emit(StreamSignal::Delta(delta));
                }
                return Ok(());
            }
        }
        // cooperative: let the ui (or the browser event loop) run between chunks
        future::yield_now().await;
    }
}

/// `idle → requesting → streaming → {completed | failed}`; a new request restarts at `requesting`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RequestState {
    #[default]
    Idle,
    Requesting,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestUpdate {
    pub document: ParsedDocument,
    /// false only on the final update; gates run-once ui work (e.g. showing the summary).
    pub streaming: bool,
}

/// what the ui hears about. every request ends in exactly one `Completed` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    Chunk(RequestUpdate),
    Failed { kind: ErrorKind, message: &'static str },
    Completed(RequestUpdate),
}

#[derive(Debug, Default)]
pub struct Orchestrator {
    generation: u64,
    state: RequestState,
    text: String,
    document: ParsedDocument,
    error: Option<RequestError>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
    pub fn state(&self) -> RequestState {
        self.state
    }
    pub fn is_loading(&self) -> bool {
        matches!(self.state, RequestState::Requesting | RequestState::Streaming)
    }
    /// everything received so far for the current request.
    pub fn text(&self) -> &str {
        &self.text
    }
    pub fn document(&self) -> &ParsedDocument {
        &self.document
    }
    pub fn error(&self) -> Option<&RequestError> {
        self.error.as_ref()
    }
    pub fn error_message(&self) -> Option<&'static str> {
        self.error.as_ref().map(RequestError::user_message)
    }

    /// start a new request: cancel the previous one and clear all per-request state.
    /// signals tagged with an older generation are ignored from here on.
    pub fn begin(&mut self) -> (u64, CancelToken) {
        self.cancel.cancel();
        self.cancel = CancelToken::new();
        self.generation += 1;
        self.state = RequestState::Requesting;
        self.text.clear();
        self.document = ParsedDocument::default();
        self.error = None;
        (self.generation, self.cancel.clone())
    }

    /// back to idle, abandoning anything in flight.
    pub fn reset(&mut self) {
        self.begin();
        self.state = RequestState::Idle;
    }

    pub fn apply(&mut self, generation: u64, signal: StreamSignal) -> Option<OrchestratorEvent> {
        if generation != self.generation {
            debug!(
                target: "bevy_dive_buddy",
                "dropping signal from superseded request {} (current {})",
                generation, self.generation
            );
            return None;
        }

        match signal {
            StreamSignal::Opened if self.is_loading() => {
                self.state = RequestState::Streaming;
                None
            }
            StreamSignal::Delta(delta) if self.is_loading() => {
                self.state = RequestState::Streaming;
                self.text.push_str(&delta);
                self.document = parse_document(&self.text);
                Some(OrchestratorEvent::Chunk(RequestUpdate {
                    document: self.document.clone(),
                    streaming: true,
                }))
            }
            StreamSignal::Error(err) if self.is_loading() => {
                self.state = RequestState::Failed;
                let event = OrchestratorEvent::Failed {
                    kind: err.kind,
                    message: err.user_message(),
                };
                self.error = Some(err);
                Some(event)
            }
            StreamSignal::Complete if self.is_loading() => {
                self.state = RequestState::Completed;
                self.document = parse_document(&self.text);
                info!(
                    target: "bevy_dive_buddy",
                    "recommendation complete: {} chars, {} locations",
                    self.text.len(),
                    self.document.locations.len()
                );
                Some(OrchestratorEvent::Completed(RequestUpdate {
                    document: self.document.clone(),
                    streaming: false,
                }))
            }
            // terminal already (e.g. `Complete` after `Error`), or idle
            _ => None,
        }
    }

    /// run one request to the end, reporting every event through `on_event`.
    pub async fn submit(
        &mut self,
        transport: &dyn ChatTransport,
        config: &DiveConfig,
        kind: &RequestKind,
        mut on_event: impl FnMut(&OrchestratorEvent),
    ) -> Result<ParsedDocument, RequestError> {
        let (generation, cancel) = self.begin();
        info!(target: "bevy_dive_buddy", "submitting request {}", generation);

        run_request(transport, config, kind, &cancel, |signal| {
            if let Some(event) = self.apply(generation, signal) {
                on_event(&event);
            }
        })
        .await;

        match (self.state, self.error.as_ref()) {
            (RequestState::Completed, _) => Ok(self.document.clone()),
            (_, Some(err)) => Err(err.clone()),
            _ => Err(RequestError::network("request ended without completing")),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::decoder::BoxedSource;
    use crate::decoder::tests::{data_line, sample_stream};
    use crate::preferences::PreferenceSet;
    use crate::prompt::ChatCompletionRequest;
    use crate::sections::Location;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// in-memory transport replaying canned chunks.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub chunks: Vec<Vec<u8>>,
        pub open_error: Option<RequestError>,
        pub read_error: Option<RequestError>,
        pub opened: AtomicUsize,
        pub closed: Arc<AtomicUsize>,
        pub last_request: Mutex<Option<(String, ChatCompletionRequest)>>,
    }

    impl ScriptedTransport {
        pub fn with_body(body: &str, chunk: usize) -> Self {
            Self {
                chunks: body.as_bytes().chunks(chunk).map(<[u8]>::to_vec).collect(),
                ..Default::default()
            }
        }
    }

    struct ScriptedSource {
        chunks: std::vec::IntoIter<Vec<u8>>,
        read_error: Option<RequestError>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChunkSource for ScriptedSource {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RequestError> {
            match self.chunks.next() {
                Some(c) => Ok(Some(c)),
                None => match self.read_error.take() {
                    Some(err) => Err(err),
                    None => Ok(None),
                },
            }
        }
        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open(
            &self,
            url: &str,
            _api_key: &str,
            body: &ChatCompletionRequest,
        ) -> Result<BoxedSource, RequestError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some((url.to_string(), body.clone()));
            if let Some(err) = &self.open_error {
                return Err(err.clone());
            }
            Ok(Box::new(ScriptedSource {
                chunks: self.chunks.clone().into_iter(),
                read_error: self.read_error.clone(),
                closed: self.closed.clone(),
            }))
        }
    }

    fn config() -> DiveConfig {
        DiveConfig::new("sk-test")
    }

    fn recommendations() -> RequestKind {
        RequestKind::Recommendations(PreferenceSet::starter())
    }

    fn signals(transport: &ScriptedTransport, config: &DiveConfig) -> Vec<StreamSignal> {
        let mut out = Vec::new();
        pollster::block_on(run_request(
            transport,
            config,
            &recommendations(),
            &CancelToken::new(),
            |s| out.push(s),
        ));
        out
    }

    fn completes(signals: &[StreamSignal]) -> usize {
        signals.iter().filter(|s| **s == StreamSignal::Complete).count()
    }

    fn top_picks_stream() -> String {
        let text = "## Top Picks\n---\n### 1. Blue Hole\nGreat visibility.\n---\n### 2. Tiger Reef\nSharks common.\n---\n**Summary:** Both great for advanced divers.";
        let mut body = String::new();
        for piece in text.split_inclusive('\n') {
            body.push_str(&data_line(piece));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[test]
    fn submit_streams_then_completes() {
        let transport = ScriptedTransport::with_body(&top_picks_stream(), 13);
        let mut orch = Orchestrator::new();
        let mut events = Vec::new();
        let doc = pollster::block_on(orch.submit(&transport, &config(), &recommendations(), |e| {
            events.push(e.clone())
        }))
        .unwrap();

        assert_eq!(doc.title, "Top Picks");
        assert_eq!(
            doc.locations,
            vec![
                Location { title: "Blue Hole".into(), content: "Great visibility.".into() },
                Location { title: "Tiger Reef".into(), content: "Sharks common.".into() },
            ]
        );
        assert_eq!(doc.summary, "Both great for advanced divers.");
        assert_eq!(orch.state(), RequestState::Completed);

        let (last, chunks) = events.split_last().unwrap();
        assert!(matches!(last, OrchestratorEvent::Completed(u) if !u.streaming && u.document == doc));
        assert!(chunks.iter().all(|e| matches!(e, OrchestratorEvent::Chunk(u) if u.streaming)));
        assert_eq!(chunks.len(), 9, "one chunk event per delta");
    }

    #[test]
    fn request_carries_prompt_and_model() {
        let transport = ScriptedTransport::with_body("data: [DONE]\n", 64);
        let cfg = config().with_model("gpt-4o-mini").with_base_url("http://localhost:9000/");
        signals(&transport, &cfg);
        let (url, body) = transport.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(url, "http://localhost:9000/v1/chat/completions");
        assert_eq!(body.model, "gpt-4o-mini");
        assert!(body.stream);
        assert!(body.messages[1].content.contains("Travel Season: July-August"));
    }

    #[test]
    fn each_document_reflects_all_deltas_so_far() {
        let transport = ScriptedTransport::with_body(&sample_stream(), 5);
        let mut orch = Orchestrator::new();
        let (g, _) = orch.begin();
        let mut seen = String::new();
        for signal in signals(&transport, &config()) {
            if let StreamSignal::Delta(d) = &signal {
                seen.push_str(d);
            }
            if let Some(OrchestratorEvent::Chunk(update)) = orch.apply(g, signal) {
                assert_eq!(update.document, parse_document(&seen));
                assert_eq!(orch.text(), seen);
            }
        }
        assert_eq!(orch.state(), RequestState::Completed);
    }

    #[test]
    fn missing_key_fails_before_network() {
        let transport = ScriptedTransport::with_body(&sample_stream(), 64);
        let out = signals(&transport, &DiveConfig::new(""));
        assert_eq!(transport.opened.load(Ordering::SeqCst), 0);
        assert_eq!(
            out,
            vec![
                StreamSignal::Error(RequestError::missing_credentials()),
                StreamSignal::Complete,
            ]
        );
    }

    #[test]
    fn open_failure_surfaces_once_then_completes() {
        let transport = ScriptedTransport {
            open_error: Some(RequestError::from_response(429, r#"{"error":{"message":"slow down"}}"#)),
            ..Default::default()
        };
        let mut orch = Orchestrator::new();
        let mut events = Vec::new();
        let res = pollster::block_on(orch.submit(&transport, &config(), &recommendations(), |e| {
            events.push(e.clone())
        }));
        assert_eq!(res.unwrap_err().kind, ErrorKind::RateLimited);
        assert_eq!(
            events,
            vec![OrchestratorEvent::Failed {
                kind: ErrorKind::RateLimited,
                message: "Rate limit exceeded. Please try again later.",
            }]
        );
        assert_eq!(orch.state(), RequestState::Failed);
        assert_eq!(orch.error_message(), Some(ErrorKind::RateLimited.user_message()));
    }

    #[test]
    fn mid_stream_failure_keeps_deltas_and_releases_source() {
        let transport = ScriptedTransport {
            read_error: Some(RequestError::network("connection reset")),
            ..ScriptedTransport::with_body(&data_line("partial"), 64)
        };
        let out = signals(&transport, &config());
        assert_eq!(
            out,
            vec![
                StreamSignal::Opened,
                StreamSignal::Delta("partial".into()),
                StreamSignal::Error(RequestError::network("connection reset")),
                StreamSignal::Complete,
            ]
        );
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completion_fires_exactly_once_on_every_path() {
        let ok = ScriptedTransport::with_body(&sample_stream(), 3);
        let no_sentinel = ScriptedTransport::with_body(&data_line("x"), 3);
        let failing = ScriptedTransport {
            open_error: Some(RequestError::from_response(500, "")),
            ..Default::default()
        };
        for t in [&ok, &no_sentinel, &failing] {
            let out = signals(t, &config());
            assert_eq!(completes(&out), 1);
            assert_eq!(out.last(), Some(&StreamSignal::Complete));
        }
        assert_eq!(completes(&signals(&ok, &DiveConfig::new(""))), 1);
    }

    #[test]
    fn sentinel_stops_deltas_within_the_same_chunk() {
        let body = format!("{}data: [DONE]\n{}", data_line("only"), data_line("ignored"));
        let transport = ScriptedTransport::with_body(&body, body.len());
        let out = signals(&transport, &config());
        assert_eq!(
            out,
            vec![StreamSignal::Opened, StreamSignal::Delta("only".into()), StreamSignal::Complete]
        );
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_request_stops_reading_and_still_completes() {
        let transport = ScriptedTransport::with_body(&sample_stream(), 4);
        let cancel = CancelToken::new();
        let mut out = Vec::new();
        pollster::block_on(run_request(&transport, &config(), &recommendations(), &cancel, |s| {
            if matches!(s, StreamSignal::Opened) {
                cancel.cancel();
            }
            out.push(s);
        }));
        assert_eq!(out, vec![StreamSignal::Opened, StreamSignal::Complete]);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    /// hands out one chunk, then waits forever like a connection that stopped sending.
    struct StalledTransport {
        closed: Arc<AtomicUsize>,
    }

    struct StalledSource {
        first: Option<Vec<u8>>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChunkSource for StalledSource {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, RequestError> {
            match self.first.take() {
                Some(c) => Ok(Some(c)),
                None => futures_lite::future::pending().await,
            }
        }
        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChatTransport for StalledTransport {
        async fn open(
            &self,
            _url: &str,
            _api_key: &str,
            _body: &ChatCompletionRequest,
        ) -> Result<BoxedSource, RequestError> {
            Ok(Box::new(StalledSource {
                first: Some(data_line("hello").into_bytes()),
                closed: self.closed.clone(),
            }))
        }
    }

    #[test]
    fn cancellation_releases_a_stalled_body() {
        let transport = StalledTransport { closed: Arc::new(AtomicUsize::new(0)) };
        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(30));
                cancel.cancel();
            })
        };
        let mut out = Vec::new();
        pollster::block_on(run_request(&transport, &config(), &recommendations(), &cancel, |s| {
            out.push(s)
        }));
        canceller.join().unwrap();

        assert_eq!(
            out,
            vec![StreamSignal::Opened, StreamSignal::Delta("hello".into()), StreamSignal::Complete]
        );
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_wakes_every_clone() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
        pollster::block_on(clone.cancelled());
    }

    #[test]
    fn superseded_request_is_ignored() {
        let mut orch = Orchestrator::new();
        let (first, first_cancel) = orch.begin();
        assert!(orch.apply(first, StreamSignal::Delta("## Old".into())).is_some());

        let (second, _) = orch.begin();
        assert!(first_cancel.is_cancelled());
        assert_eq!(orch.text(), "");
        assert_eq!(orch.state(), RequestState::Requesting);

        assert_eq!(orch.apply(first, StreamSignal::Delta(" late".into())), None);
        assert_eq!(orch.apply(first, StreamSignal::Complete), None);
        assert_eq!(orch.text(), "");

        assert!(orch.apply(second, StreamSignal::Delta("## New".into())).is_some());
        assert_eq!(orch.document().title, "New");
    }

    #[test]
    fn error_then_complete_yields_single_terminal_event() {
        let mut orch = Orchestrator::new();
        let (g, _) = orch.begin();
        let failed = orch.apply(g, StreamSignal::Error(RequestError::network("boom")));
        assert!(matches!(failed, Some(OrchestratorEvent::Failed { kind: ErrorKind::NetworkOrUnclassified, .. })));
        assert_eq!(orch.apply(g, StreamSignal::Complete), None);
        assert_eq!(orch.apply(g, StreamSignal::Delta("x".into())), None);
        assert_eq!(orch.state(), RequestState::Failed);
    }

    #[test]
    fn reset_returns_to_idle() {
        let mut orch = Orchestrator::new();
        let (g, cancel) = orch.begin();
        orch.apply(g, StreamSignal::Delta("abc".into()));
        orch.reset();
        assert!(cancel.is_cancelled());
        assert_eq!(orch.state(), RequestState::Idle);
        assert!(!orch.is_loading());
        assert_eq!(orch.text(), "");
    }
}
