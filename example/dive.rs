//! bevy_dive_buddy demo: pick diving preferences and watch recommendations stream in.
//! - tab / shift+tab: move between preference facets
//! - left / right: move between options; space: toggle the highlighted option
//! - enter: request recommendations (required facets must be filled)
//! - up / down: select a location; i: more details; f: toggle favorite
//!
//! the first recommendation is served from the 24h cache when one exists.
//! config comes from OPENAI_API_KEY / LLM_BASE_URL / LLM_MODEL. set DIVE_LATITUDE to
//! preselect the travel seasons that suit your hemisphere.

use bevy::prelude::*;
use bevy_dive_buddy::{
    DiveBuddyPlugin, DiveSet, Facet, ParsedDocument, PreferenceSet, RecommendationChunkEvt,
    RecommendationCompletedEvt, RecommendationErrorEvt, RecommendationSession,
    RecommendationStarted, RecommendationStore, request_additional_info, request_recommendations,
    starter_for,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct FormText;
#[derive(Component)]
struct StatusText;
#[derive(Component)]
struct DocumentText;
#[derive(Component)]
struct DetailsText;

/// the session that answers preference requests
#[derive(Component)]
struct MainSession;
/// the session that answers "more details" requests
#[derive(Component)]
struct DetailsSession;

// ---------------------- app state ----------------------

#[derive(Resource)]
struct Form {
    preferences: PreferenceSet,
    facet: usize,
    option: usize,
    error: Option<String>,
}

impl Default for Form {
    fn default() -> Self {
        Self { preferences: starting_preferences(), facet: 0, option: 0, error: None }
    }
}

/// starter preferences, with seasons picked for DIVE_LATITUDE when it is set.
fn starting_preferences() -> PreferenceSet {
    match std::env::var("DIVE_LATITUDE").ok().and_then(|v| v.trim().parse::<f64>().ok()) {
        Some(latitude) => {
            info!(target: "dive", "suggesting seasons for latitude {}", latitude);
            starter_for(latitude, chrono::Utc::now())
        }
        None => PreferenceSet::starter(),
    }
}

impl Form {
    fn facet(&self) -> Facet {
        Facet::ALL[self.facet]
    }
}

#[derive(Resource, Default)]
struct Shown {
    document: ParsedDocument,
    streaming: bool,
    selected: usize,
    status: String,
}

// ---------------------- main ----------------------

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(10, 24, 38)))
        .insert_resource(open_store())
        .init_resource::<Form>()
        .init_resource::<Shown>()
        .add_plugins(DefaultPlugins)
        .add_plugins(DiveBuddyPlugin)
        .add_systems(Startup, (setup, initial_recommendations).chain())
        .add_systems(Update, (handle_form_keys, handle_result_keys, refresh_form_text, refresh_document_text))
        // event readers should run after bevy_dive_buddy emits events
        .add_systems(Update, (on_started, on_chunk, on_done, on_error).after(DiveSet::Drain))
        .run();
}

#[cfg(not(target_arch = "wasm32"))]
fn open_store() -> RecommendationStore {
    let store = bevy_dive_buddy::storage::JsonFileStore::open_default();
    info!(target: "dive", "using store {}", store.path().display());
    RecommendationStore::new(store)
}

#[cfg(target_arch = "wasm32")]
fn open_store() -> RecommendationStore {
    RecommendationStore::new(bevy_dive_buddy::storage::LocalStorageStore)
}

// ---------------------- setup ui ----------------------

fn setup(mut commands: Commands) {
    commands.spawn(Camera2d);
    commands.spawn((RecommendationSession::default(), MainSession));
    commands.spawn((RecommendationSession::default(), DetailsSession));

    let style_18 = TextFont { font_size: 18.0, ..default() };
    let style_14 = TextFont { font_size: 14.0, ..default() };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Row,
                column_gap: Val::Px(12.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            // --- preference form ---
            p.spawn((
                Node {
                    width: Val::Percent(35.0),
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(6.0),
                    padding: UiRect::all(Val::Px(8.0)),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.08, 0.14, 0.2)),
            ))
            .with_children(|c| {
                c.spawn((Text::new(""), style_14.clone(), TextColor(Color::WHITE), FormText));
            });

            // --- results ---
            p.spawn((
                Node {
                    width: Val::Percent(65.0),
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(8.0),
                    padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                    ..default()
                },
                BackgroundColor(Color::NONE),
            ))
            .with_children(|c| {
                c.spawn((Text::new(""), style_14.clone(), TextColor(Color::srgb_u8(120, 200, 230)), StatusText));
                c.spawn((Text::new(""), style_18.clone(), TextColor(Color::WHITE), DocumentText));
                c.spawn((Text::new(""), style_14.clone(), TextColor(Color::srgb_u8(200, 200, 200)), DetailsText));
            });
        });
}

fn initial_recommendations(
    mut commands: Commands,
    store: Res<RecommendationStore>,
    mut shown: ResMut<Shown>,
    q_main: Query<Entity, With<MainSession>>,
) {
    if let Some(document) = store.cached_document() {
        info!(target: "dive", "showing cached recommendations");
        shown.document = document;
        shown.status = "cached recommendations (less than a day old)".into();
        return;
    }
    if let Ok(main) = q_main.single() {
        // starter preferences always validate
        if let Err(err) = request_recommendations(&mut commands, main, starting_preferences()) {
            shown.status = err.to_string();
        }
    }
}

// ---------------------- input ----------------------

fn handle_form_keys(
    mut commands: Commands,
    keys: Res<ButtonInput<KeyCode>>,
    mut form: ResMut<Form>,
    q_main: Query<(Entity, &RecommendationSession), With<MainSession>>,
) {
    let shift = keys.pressed(KeyCode::ShiftLeft) || keys.pressed(KeyCode::ShiftRight);
    let facets = Facet::ALL.len();

    if keys.just_pressed(KeyCode::Tab) {
        form.facet = if shift { (form.facet + facets - 1) % facets } else { (form.facet + 1) % facets };
        form.option = 0;
    }

    let options = form.facet().options().len();
    if options > 0 {
        if keys.just_pressed(KeyCode::ArrowRight) {
            form.option = (form.option + 1) % options;
        }
        if keys.just_pressed(KeyCode::ArrowLeft) {
            form.option = (form.option + options - 1) % options;
        }
        if keys.just_pressed(KeyCode::Space) {
            let facet = form.facet();
            let (value, _) = facet.options()[form.option];
            form.preferences.toggle(facet, value);
            form.error = None;
        }
    }

    if keys.just_pressed(KeyCode::Enter) {
        let Ok((main, session)) = q_main.single() else { return };
        if session.is_loading() {
            info!(target: "dive", "superseding in-flight request");
        }
        match request_recommendations(&mut commands, main, form.preferences.clone()) {
            Ok(()) => form.error = None,
            Err(err) => {
                warn!(target: "dive", "{}", err);
                form.error = Some(err.to_string());
            }
        }
    }
}

fn handle_result_keys(
    mut commands: Commands,
    keys: Res<ButtonInput<KeyCode>>,
    store: Res<RecommendationStore>,
    mut shown: ResMut<Shown>,
    q_details: Query<Entity, With<DetailsSession>>,
    mut q_details_text: Query<&mut Text, With<DetailsText>>,
) {
    let count = shown.document.locations.len();
    if count == 0 {
        return;
    }
    if keys.just_pressed(KeyCode::ArrowDown) {
        shown.selected = (shown.selected + 1) % count;
    }
    if keys.just_pressed(KeyCode::ArrowUp) {
        shown.selected = (shown.selected + count - 1) % count;
    }
    let selected = shown.selected.min(count - 1);
    let location = shown.document.locations[selected].clone();

    if keys.just_pressed(KeyCode::KeyI)
        && let Ok(details) = q_details.single()
    {
        if let Ok(mut t) = q_details_text.single_mut() {
            t.0 = format!("loading details for {}...", location.title);
        }
        request_additional_info(&mut commands, details, &location);
    }

    if keys.just_pressed(KeyCode::KeyF) {
        match store.favorites().toggle(&location.title, &location.content, chrono::Utc::now()) {
            Ok(true) => shown.status = format!("saved {} to favorites", location.title),
            Ok(false) => shown.status = format!("removed {} from favorites", location.title),
            Err(err) => shown.status = format!("could not update favorites: {err}"),
        }
    }
}

// ---------------------- text refresh ----------------------

fn refresh_form_text(form: Res<Form>, mut q: Query<&mut Text, With<FormText>>) {
    if !form.is_changed() {
        return;
    }
    let Ok(mut t) = q.single_mut() else { return };

    let mut out = String::from("preferences (* = required)\n\n");
    for (i, facet) in Facet::ALL.into_iter().enumerate() {
        let marker = if i == form.facet { ">" } else { " " };
        let required = if facet.is_required() { "*" } else { "" };
        let values = form.preferences.values(facet);
        let values = if values.is_empty() { "-".to_string() } else { values.join(", ") };
        out.push_str(&format!("{marker} {}{required}: {values}\n", facet.label()));
    }

    let facet = form.facet();
    out.push_str(&format!("\n{} options:\n", facet.label()));
    for (i, (value, description)) in facet.options().iter().enumerate() {
        let cursor = if i == form.option { ">" } else { " " };
        let checked = if form.preferences.contains(facet, value) { "[x]" } else { "[ ]" };
        out.push_str(&format!("{cursor} {checked} {value} - {description}\n"));
    }

    if let Some(err) = &form.error {
        out.push_str(&format!("\n{err}\n"));
    }
    t.0 = out;
}

fn refresh_document_text(
    shown: Res<Shown>,
    store: Res<RecommendationStore>,
    mut sets: ParamSet<(Query<&mut Text, With<DocumentText>>, Query<&mut Text, With<StatusText>>)>,
) {
    if !shown.is_changed() {
        return;
    }
    if let Ok(mut t) = sets.p1().single_mut() {
        t.0 = shown.status.clone();
    }

    let doc = &shown.document;
    let mut out = String::new();
    if !doc.title.is_empty() {
        out.push_str(&doc.title);
        out.push_str("\n\n");
    }
    let favorites = store.favorites();
    for (i, location) in doc.locations.iter().enumerate() {
        let cursor = if i == shown.selected { ">" } else { " " };
        let star = if favorites.is_favorite(&location.title) { " *" } else { "" };
        out.push_str(&format!("{cursor} {}. {}{star}\n{}\n\n", i + 1, location.title, location.content));
    }
    // the summary only shows once the stream is finished
    if !shown.streaming && !doc.summary.is_empty() {
        out.push_str("Summary: ");
        out.push_str(&doc.summary);
    }
    if let Ok(mut t) = sets.p0().single_mut() {
        t.0 = out;
    }
}

// ---------------------- recommendation events ----------------------

fn on_started(
    mut ev: EventReader<RecommendationStarted>,
    q_main: Query<(), With<MainSession>>,
    mut shown: ResMut<Shown>,
) {
    for RecommendationStarted { entity } in ev.read() {
        if q_main.contains(*entity) {
            shown.document = ParsedDocument::default();
            shown.streaming = true;
            shown.selected = 0;
            shown.status = "asking the dive guide...".into();
        }
    }
}

fn on_chunk(
    mut ev: EventReader<RecommendationChunkEvt>,
    q_main: Query<(), With<MainSession>>,
    mut shown: ResMut<Shown>,
    mut q_details_text: Query<&mut Text, With<DetailsText>>,
) {
    for RecommendationChunkEvt { entity, document, streaming } in ev.read() {
        if q_main.contains(*entity) {
            shown.document = document.clone();
            shown.streaming = *streaming;
        } else if let Ok(mut t) = q_details_text.single_mut() {
            t.0 = render_details(document);
        }
    }
}

fn on_done(
    mut ev: EventReader<RecommendationCompletedEvt>,
    q_main: Query<(), With<MainSession>>,
    mut shown: ResMut<Shown>,
    mut q_details_text: Query<&mut Text, With<DetailsText>>,
) {
    for RecommendationCompletedEvt { entity, document, raw_text } in ev.read() {
        if q_main.contains(*entity) {
            info!(target: "dive", "recommendations done ({} chars)", raw_text.len());
            shown.document = document.clone();
            shown.streaming = false;
            shown.status = format!("{} locations", document.locations.len());
        } else if let Ok(mut t) = q_details_text.single_mut() {
            t.0 = render_details(document);
        }
    }
}

fn on_error(
    mut ev: EventReader<RecommendationErrorEvt>,
    mut shown: ResMut<Shown>,
) {
    for RecommendationErrorEvt { entity, kind, message } in ev.read() {
        error!(target: "dive", "request error (entity={:?}, kind={:?})", entity, kind);
        shown.streaming = false;
        shown.status = format!("ERROR: {message}");
    }
}

fn render_details(document: &ParsedDocument) -> String {
    let mut out = String::new();
    if !document.title.is_empty() {
        out.push_str(&document.title);
        out.push('\n');
    }
    for location in &document.locations {
        out.push_str(&format!("{}\n{}\n", location.title, location.content));
    }
    if !document.summary.is_empty() {
        out.push_str(&document.summary);
    }
    out
}
