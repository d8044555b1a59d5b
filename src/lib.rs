//! bevy_dive_buddy: streamed dive-destination recommendations for bevy.
//!
//! - builds a prompt from diver preferences and streams an openai-compatible chat completion.
//! - re-parses the accumulated markdown on every delta into title / locations / summary.
//! - emits progress as bevy events; every request ends in exactly one completed or error event.
//! - never blocks the main thread: on native the request runs on a tiny tokio runtime
//!   (body reads on a worker thread); on wasm we use bevy's async pool, which yields to
//!   the browser event loop.
//!
//! the core pieces are usable without the plugin:
//!   - parsing:       [`parse_document`]
//!   - wire decoding: [`StreamDecoder`]
//!   - one request:   [`Orchestrator::submit`] / [`run_request`]

use bevy::prelude::*;
use bevy::tasks::AsyncComputeTaskPool;
use chrono::Utc;
use flume::{Receiver, Sender, TryRecvError};
use std::collections::HashMap;
use std::sync::Arc;

pub mod config;
pub mod decoder;
pub mod error;
pub mod history;
pub mod orchestrator;
pub mod preferences;
pub mod prompt;
pub mod sections;
pub mod storage;
pub mod transport;

pub use config::DiveConfig;
pub use decoder::{BoxedSource, ChunkSource, StreamDecoder};
pub use error::{ErrorKind, PreferenceError, RequestError, StorageError};
pub use history::{
    FavoriteDestinations, FavoriteEntry, HistoryEntry, RecommendationCache, RecommendationHistory,
};
pub use orchestrator::{
    CancelToken, Orchestrator, OrchestratorEvent, RequestState, RequestUpdate, StreamSignal,
    run_request,
};
pub use preferences::{Facet, PreferenceSet, recommended_seasons, starter_for};
pub use prompt::{ChatCompletionRequest, RequestKind};
pub use sections::{Location, ParsedDocument, parse_document};
pub use storage::{KeyValueStore, MemoryStore};
pub use transport::{ChatTransport, default_transport};

/// on native we keep a tiny tokio runtime to drive request futures.
/// we spawn onto this rt from compute tasks so neither the main thread
/// nor bevy's compute pools block.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_dive_buddy", "DiveBuddy: initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum DiveSet {
    /// Recommendation* events are emitted here (in `Update`)
    Drain,
}

/// the http transport used for every session; defaults to the platform transport.
#[derive(Resource, Clone)]
pub struct Transport(pub Arc<dyn ChatTransport>);

impl Default for Transport {
    fn default() -> Self {
        Self(default_transport())
    }
}

/// optional persistence. when present, completed recommendations are appended to the
/// user's history and become the cached starter recommendation.
#[derive(Resource, Clone)]
pub struct RecommendationStore(pub Arc<dyn KeyValueStore>);

impl RecommendationStore {
    pub fn new(store: impl KeyValueStore + 'static) -> Self {
        Self(Arc::new(store))
    }

    pub fn user_id(&self) -> String {
        history::user_id(self.0.as_ref(), Utc::now())
    }

    pub fn history(&self) -> RecommendationHistory {
        RecommendationHistory::new(self.0.clone(), self.user_id())
    }

    pub fn favorites(&self) -> FavoriteDestinations {
        FavoriteDestinations::new(self.0.clone(), self.user_id())
    }

    pub fn cache(&self) -> RecommendationCache {
        RecommendationCache::new(self.0.clone())
    }

    /// the cached recommendation, already parsed, if it is still fresh.
    pub fn cached_document(&self) -> Option<ParsedDocument> {
        self.cache().load(Utc::now()).map(|text| parse_document(&text))
    }
}

/// attach this to an entity that shows recommendations.
/// one request is in flight per session; a new request supersedes the old one.
#[derive(Component, Debug, Default)]
pub struct RecommendationSession {
    orchestrator: Orchestrator,
    request: Option<RequestKind>,
}

impl RecommendationSession {
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// what the current (or last) request asked for.
    pub fn request(&self) -> Option<&RequestKind> {
        self.request.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.orchestrator.is_loading()
    }
}

/// insert this component to trigger a request for the session entity.
#[derive(Component, Clone, Debug)]
pub struct RecommendationRequest {
    pub kind: RequestKind,
}

/// validate preferences and enqueue a recommendation request on a session entity.
pub fn request_recommendations(
    commands: &mut Commands,
    target: Entity,
    preferences: PreferenceSet,
) -> Result<(), PreferenceError> {
    preferences.validate()?;
    info!(target: "bevy_dive_buddy", "request_recommendations -> {:?}", target);
    commands.entity(target).insert(RecommendationRequest {
        kind: RequestKind::Recommendations(preferences),
    });
    Ok(())
}

/// enqueue a "more details" request for one location.
pub fn request_additional_info(
    commands: &mut Commands,
    target: Entity,
    location: &Location,
) {
    info!(target: "bevy_dive_buddy", "request_additional_info -> '{}'", location.title);
    commands.entity(target).insert(RecommendationRequest {
        kind: RequestKind::AdditionalInfo {
            title: location.title.clone(),
            content: location.content.clone(),
        },
    });
}

/// events emitted during/after a request.
#[derive(Event, Debug)]
pub struct RecommendationStarted {
    pub entity: Entity,
}
/// the document re-parsed from everything received so far (latest per frame).
#[derive(Event, Debug)]
pub struct RecommendationChunkEvt {
    pub entity: Entity,
    pub document: ParsedDocument,
    pub streaming: bool,
}
#[derive(Event, Debug)]
pub struct RecommendationCompletedEvt {
    pub entity: Entity,
    pub document: ParsedDocument,
    pub raw_text: String,
}
#[derive(Event, Debug)]
pub struct RecommendationErrorEvt {
    pub entity: Entity,
    pub kind: ErrorKind,
    /// fixed user-facing text for `kind`
    pub message: &'static str,
}

/// cross-thread inbox for streaming; producers send, main thread drains.
/// bounded to avoid unbounded growth when the frame stalls briefly.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

#[derive(Debug)]
struct StreamMsg {
    entity: Entity,
    generation: u64,
    signal: StreamSignal,
}

/// bevy plugin: wires systems, events, resources.
/// `DiveConfig` is read from the environment unless inserted beforehand;
/// on native, also inserts a tiny tokio runtime resource by default.
pub struct DiveBuddyPlugin;

impl Plugin for DiveBuddyPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_dive_buddy", "DiveBuddyPlugin: build()");
        app.init_resource::<StreamInbox>()
            .init_resource::<Transport>()
            .add_event::<RecommendationStarted>()
            .add_event::<RecommendationChunkEvt>()
            .add_event::<RecommendationCompletedEvt>()
            .add_event::<RecommendationErrorEvt>()
            // write + read events in the same schedule (Update)
            .configure_sets(Update, DiveSet::Drain)
            .add_systems(Update, drain_stream_inbox.in_set(DiveSet::Drain))
            .add_systems(Update, record_completed.after(DiveSet::Drain))
            // spawn requests in Update; work continues off-thread/tokio
            .add_systems(Update, spawn_recommendation_requests.before(DiveSet::Drain));

        if app.world().get_resource::<DiveConfig>().is_none() {
            let config = DiveConfig::from_env();
            if !config.has_credentials() {
                warn!(target: "bevy_dive_buddy", "OPENAI_API_KEY is not set; requests will fail");
            }
            app.insert_resource(config);
        }

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

/// spawns async tasks to fulfill pending requests (compute-tasks-first).
fn spawn_recommendation_requests(
    mut commands: Commands,
    transport: Res<Transport>,
    config: Res<DiveConfig>,
    inbox: Res<StreamInbox>,
    mut q: Query<(Entity, &mut RecommendationSession, &RecommendationRequest)>,
    mut ev_start: EventWriter<RecommendationStarted>,

    // native-only: small runtime to drive network futures
    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    for (e, mut session, req) in q.iter_mut() {
        // supersedes (and cancels) whatever this session had in flight
        let (generation, cancel) = session.orchestrator.begin();
        session.request = Some(req.kind.clone());

        info!(target: "bevy_dive_buddy",
            "spawn_recommendation_requests: entity={:?} generation={} kind={} model={}",
            e,
            generation,
            match req.kind {
                RequestKind::Recommendations(_) => "recommendations",
                RequestKind::AdditionalInfo { .. } => "additional_info",
            },
            config.model_or_default(),
        );

        // one-shot marker removal
        commands.entity(e).remove::<RecommendationRequest>();
        ev_start.write(RecommendationStarted { entity: e });

        let transport = transport.0.clone();
        let config = config.clone();
        let kind = req.kind.clone();
        let inbox_tx = inbox.tx.clone();

        let pool = AsyncComputeTaskPool::get();
        #[cfg(not(target_arch = "wasm32"))]
        let rt = rt.0.clone();

        pool.spawn(async move {
            let run = async move {
                run_request(transport.as_ref(), &config, &kind, &cancel, |signal| {
                    // ignore full/disconnected: the app is shutting down
                    let _ = inbox_tx.send(StreamMsg { entity: e, generation, signal });
                })
                .await;
            };

            #[cfg(target_arch = "wasm32")]
            {
                // wasm path: just await directly (no tokio).
                run.await;
            }
            #[cfg(not(target_arch = "wasm32"))]
            {
                // native: hand off to tokio so bevy pools stay free.
                let _ = rt.spawn(run).await;
            }
        })
        .detach();
    }
}

/// drains the inbox through each session's orchestrator and emits user-facing events.
fn drain_stream_inbox(
    inbox: Res<StreamInbox>,
    mut sessions: Query<&mut RecommendationSession>,
    mut ev_chunk: EventWriter<RecommendationChunkEvt>,
    mut ev_done: EventWriter<RecommendationCompletedEvt>,
    mut ev_err: EventWriter<RecommendationErrorEvt>,
) {
    // drain up to a cap per frame to avoid long frames on bursty streams
    const MAX_PER_FRAME: usize = 512;
    let mut drained = Vec::with_capacity(64);
    for _ in 0..MAX_PER_FRAME {
        match inbox.rx.try_recv() {
            Ok(m) => drained.push(m),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
    if drained.is_empty() { return; }

    // only the newest document per entity matters to the ui
    let mut latest: HashMap<Entity, RequestUpdate> = HashMap::new();
    let mut dones: Vec<(Entity, ParsedDocument, String)> = Vec::new();
    let mut errs: Vec<(Entity, ErrorKind, &'static str)> = Vec::new();

    for StreamMsg { entity, generation, signal } in drained {
        let Ok(mut session) = sessions.get_mut(entity) else {
            debug!(target: "bevy_dive_buddy", "dropping signal for missing session {:?}", entity);
            continue;
        };
        match session.orchestrator.apply(generation, signal) {
            Some(OrchestratorEvent::Chunk(update)) => {
                latest.insert(entity, update);
            }
            Some(OrchestratorEvent::Completed(update)) => {
                latest.remove(&entity);
                let raw_text = session.orchestrator.text().to_string();
                dones.push((entity, update.document, raw_text));
            }
            Some(OrchestratorEvent::Failed { kind, message }) => {
                errs.push((entity, kind, message));
            }
            None => {}
        }
    }

    for (entity, update) in latest {
        ev_chunk.write(RecommendationChunkEvt {
            entity,
            document: update.document,
            streaming: update.streaming,
        });
    }
    // ensure chunks land before "done" for the same frame
    for (entity, document, raw_text) in dones {
        ev_done.write(RecommendationCompletedEvt { entity, document, raw_text });
    }
    for (entity, kind, message) in errs {
        ev_err.write(RecommendationErrorEvt { entity, kind, message });
    }
}

/// appends finished recommendations to history and refreshes the cache.
fn record_completed(
    store: Option<Res<RecommendationStore>>,
    sessions: Query<&RecommendationSession>,
    mut ev_done: EventReader<RecommendationCompletedEvt>,
) {
    let Some(store) = store else {
        ev_done.clear();
        return;
    };
    for done in ev_done.read() {
        // additional-info answers are not recommendations
        let Some(preferences) = sessions
            .get(done.entity)
            .ok()
            .and_then(RecommendationSession::request)
            .and_then(RequestKind::preferences)
        else {
            continue;
        };
        let now = Utc::now();
        if let Err(err) = store.history().add(preferences.clone(), &done.raw_text, now) {
            warn!(target: "bevy_dive_buddy", "failed to record history: {}", err);
        }
        if let Err(err) = store.cache().store(&done.raw_text, now) {
            warn!(target: "bevy_dive_buddy", "failed to cache recommendation: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::tests::data_line;
    use crate::orchestrator::tests::ScriptedTransport;
    use std::time::Duration;

    /// collects every event the plugin emits, since bevy events only live two frames.
    #[derive(Resource, Default)]
    struct Seen {
        started: usize,
        chunks: Vec<ParsedDocument>,
        done: Vec<(ParsedDocument, String)>,
        errors: Vec<(ErrorKind, &'static str)>,
    }

    fn collect(
        mut seen: ResMut<Seen>,
        mut ev_start: EventReader<RecommendationStarted>,
        mut ev_chunk: EventReader<RecommendationChunkEvt>,
        mut ev_done: EventReader<RecommendationCompletedEvt>,
        mut ev_err: EventReader<RecommendationErrorEvt>,
    ) {
        seen.started += ev_start.read().count();
        for c in ev_chunk.read() {
            seen.chunks.push(c.document.clone());
        }
        for d in ev_done.read() {
            seen.done.push((d.document.clone(), d.raw_text.clone()));
        }
        for e in ev_err.read() {
            seen.errors.push((e.kind, e.message));
        }
    }

    fn app_with(transport: ScriptedTransport, config: DiveConfig) -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.insert_resource(config);
        app.add_plugins(DiveBuddyPlugin);
        app.insert_resource(Transport(Arc::new(transport)));
        app.init_resource::<Seen>();
        app.add_systems(Update, collect.after(DiveSet::Drain));
        app
    }

    fn run_until_settled(app: &mut App) {
        for _ in 0..400 {
            app.update();
            let seen = app.world().resource::<Seen>();
            if !seen.done.is_empty() || !seen.errors.is_empty() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("request never settled");
    }

    fn stream(text: &str) -> String {
        let mut body: String = text.split_inclusive('\n').map(data_line).collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[test]
    fn incomplete_preferences_are_rejected_up_front() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        let e = app.world_mut().spawn(RecommendationSession::default()).id();

        let mut prefs = PreferenceSet::starter();
        prefs.set(Facet::Season, Vec::new());
        {
            let mut commands = app.world_mut().commands();
            let err = request_recommendations(&mut commands, e, prefs).unwrap_err();
            assert_eq!(err, PreferenceError::Incomplete(vec![Facet::Season]));
            request_recommendations(&mut commands, e, PreferenceSet::starter()).unwrap();
        }
        app.world_mut().flush();

        let req = app.world().entity(e).get::<RecommendationRequest>().expect("request exists");
        assert_eq!(req.kind, RequestKind::Recommendations(PreferenceSet::starter()));
    }

    #[test]
    fn additional_info_request_carries_location() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        let e = app.world_mut().spawn(RecommendationSession::default()).id();
        let location = Location { title: "Blue Hole".into(), content: "Deep.".into() };
        {
            let mut commands = app.world_mut().commands();
            request_additional_info(&mut commands, e, &location);
        }
        app.world_mut().flush();

        let req = app.world().entity(e).get::<RecommendationRequest>().unwrap();
        assert_eq!(
            req.kind,
            RequestKind::AdditionalInfo { title: "Blue Hole".into(), content: "Deep.".into() }
        );
    }

    #[test]
    fn drain_applies_signals_through_the_session() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<RecommendationChunkEvt>();
        app.add_event::<RecommendationCompletedEvt>();
        app.add_event::<RecommendationErrorEvt>();
        app.insert_resource(StreamInbox::default());
        app.add_systems(Update, super::drain_stream_inbox);

        let mut session = RecommendationSession::default();
        let (stale, _) = session.orchestrator.begin();
        let (current, _) = session.orchestrator.begin();
        let e = app.world_mut().spawn(session).id();

        {
            let tx = app.world().resource::<StreamInbox>().tx.clone();
            let send = |generation, signal| tx.send(StreamMsg { entity: e, generation, signal }).unwrap();
            send(current, StreamSignal::Opened);
            send(current, StreamSignal::Delta("## Top".into()));
            send(stale, StreamSignal::Delta(" ignored".into()));
            send(current, StreamSignal::Delta(" Picks".into()));
        }
        app.update();
        {
            let mut ev = app.world_mut().resource_mut::<Events<RecommendationChunkEvt>>();
            let chunks: Vec<_> = ev.drain().collect();
            assert_eq!(chunks.len(), 1, "one coalesced chunk per entity per frame");
            assert_eq!(chunks[0].document.title, "Top Picks");
            assert!(chunks[0].streaming);
        }

        {
            let tx = app.world().resource::<StreamInbox>().tx.clone();
            tx.send(StreamMsg { entity: e, generation: current, signal: StreamSignal::Complete }).unwrap();
        }
        app.update();
        {
            let mut ev = app.world_mut().resource_mut::<Events<RecommendationCompletedEvt>>();
            let done: Vec<_> = ev.drain().collect();
            assert_eq!(done.len(), 1);
            assert_eq!(done[0].raw_text, "## Top Picks");
        }
        {
            let mut ev = app.world_mut().resource_mut::<Events<RecommendationErrorEvt>>();
            assert_eq!(ev.drain().count(), 0, "no errors expected");
        }
    }

    #[test]
    fn plugin_streams_and_records_history() {
        let text = "## Top Picks\n---\n### 1. Blue Hole\nGreat visibility.\n---\n**Summary:** Go.";
        let mut app = app_with(ScriptedTransport::with_body(&stream(text), 11), DiveConfig::new("sk-test"));
        let store = Arc::new(MemoryStore::new());
        app.insert_resource(RecommendationStore(store.clone()));

        let e = app.world_mut().spawn(RecommendationSession::default()).id();
        {
            let mut commands = app.world_mut().commands();
            request_recommendations(&mut commands, e, PreferenceSet::starter()).unwrap();
        }
        app.world_mut().flush();
        run_until_settled(&mut app);
        // one more frame so the recorder has seen the completion
        app.update();

        let seen = app.world().resource::<Seen>();
        assert_eq!(seen.started, 1);
        assert!(seen.errors.is_empty());
        assert_eq!(seen.done.len(), 1);
        let (doc, raw) = &seen.done[0];
        assert_eq!(raw, text);
        assert_eq!(doc.title, "Top Picks");
        assert_eq!(doc.locations.len(), 1);
        assert_eq!(doc.summary, "Go.");
        assert!(seen.chunks.iter().all(|c| c.locations.len() <= 1));

        let session = app.world().entity(e).get::<RecommendationSession>().unwrap();
        assert_eq!(session.orchestrator().state(), RequestState::Completed);
        assert!(app.world().entity(e).get::<RecommendationRequest>().is_none());

        let recorded = RecommendationStore(store);
        let history = recorded.history().entries();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].recommendation, text);
        assert_eq!(history[0].preferences, PreferenceSet::starter());
        assert_eq!(recorded.cached_document().map(|d| d.title), Some("Top Picks".to_string()));
    }

    #[test]
    fn missing_key_surfaces_configuration_error() {
        let mut app = app_with(ScriptedTransport::with_body("data: [DONE]\n", 64), DiveConfig::new(""));
        let e = app.world_mut().spawn(RecommendationSession::default()).id();
        {
            let mut commands = app.world_mut().commands();
            request_recommendations(&mut commands, e, PreferenceSet::starter()).unwrap();
        }
        app.world_mut().flush();
        run_until_settled(&mut app);

        let seen = app.world().resource::<Seen>();
        assert!(seen.done.is_empty());
        assert_eq!(
            seen.errors,
            vec![(ErrorKind::ConfigurationMissing, ErrorKind::ConfigurationMissing.user_message())]
        );
    }
}
