//! diver preferences: one multi-select set of values per facet.

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::error::PreferenceError;

/// one named preference dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Facet {
    ExperienceLevel,
    Interests,
    Season,
    Region,
    WaterTemperature,
    Visibility,
    CurrentStrength,
    MaxDepth,
}

impl Facet {
    pub const ALL: [Facet; 8] = [
        Facet::ExperienceLevel,
        Facet::Interests,
        Facet::Season,
        Facet::Region,
        Facet::WaterTemperature,
        Facet::Visibility,
        Facet::CurrentStrength,
        Facet::MaxDepth,
    ];

    /// facets that must be non-empty before a request is allowed.
    pub const REQUIRED: [Facet; 3] = [Facet::ExperienceLevel, Facet::Interests, Facet::Season];

    pub fn label(self) -> &'static str {
        match self {
            Facet::ExperienceLevel => "Experience Level",
            Facet::Interests => "Interests",
            Facet::Season => "Travel Season",
            Facet::Region => "Region",
            Facet::WaterTemperature => "Water Temperature",
            Facet::Visibility => "Visibility",
            Facet::CurrentStrength => "Current Strength",
            Facet::MaxDepth => "Max Depth",
        }
    }

    pub fn is_required(self) -> bool {
        Self::REQUIRED.contains(&self)
    }

    /// selectable values with a short description, in display order.
    pub fn options(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Facet::ExperienceLevel => &[
                ("Beginner", "No diving certification. Want to do an Open Water course"),
                ("Open Water", "Basic certification (PADI/SSI Open Water Diver or equivalent)"),
                ("Advanced", "Advanced certification (PADI/SSI Advanced Open Water or equivalent)"),
                ("Rescue", "Rescue Diver certification (PADI/SSI Rescue Diver or equivalent)"),
                ("Professional", "Professional level (Divemaster/Instructor or equivalent)"),
                ("Technical", "Technical diving certification (TDI/PADI Tec certifications)"),
            ],
            Facet::Interests => &[
                ("Coral Reefs", "Hard and soft coral gardens"),
                ("Wreck Diving", "Sunken ships, aircraft and artificial reefs"),
                ("Marine Life", "Big animals, macro and seasonal migrations"),
                ("Cave Diving", "Caverns, caves and cenotes"),
            ],
            Facet::Season => &[
                ("January-February", "Early year, winter in North / summer in South"),
                ("March-April", "Spring in North / autumn in South"),
                ("May-June", "Late spring in North / late autumn in South"),
                ("July-August", "Summer in North / winter in South"),
                ("September-October", "Autumn in North / spring in South"),
                ("November-December", "Early winter in North / early summer in South"),
            ],
            Facet::Region => &[
                ("Americas", "North and South America"),
                ("Europe", "Including Mediterranean"),
                ("Asia-Pacific", "Including Australia and Pacific Islands"),
                ("South-East Asia", "Thailand, Indonesia, Philippines etc."),
                ("Africa", "Including Red Sea"),
                ("Caribbean", "Caribbean Islands"),
                ("Indian Ocean", "Including Maldives and Seychelles"),
            ],
            Facet::WaterTemperature => &[
                ("Warm (>25°C/77°F)", "Tropical waters, minimal exposure suit needed"),
                ("Moderate (20-25°C/68-77°F)", "Comfortable with light wetsuit"),
                ("Cool (15-20°C/59-68°F)", "Thicker wetsuit required"),
                ("Cold (<15°C/59°F)", "Drysuit recommended"),
            ],
            Facet::Visibility => &[
                ("Excellent (>30m/100ft)", "Crystal clear waters, perfect for photography"),
                ("Good (15-30m/50-100ft)", "Very good conditions for most diving activities"),
                ("Moderate (5-15m/15-50ft)", "Acceptable for most dive types"),
                ("Limited (<5m/15ft)", "Challenging conditions, for experienced divers"),
            ],
            Facet::CurrentStrength => &[
                ("None", "No noticeable current"),
                ("Mild", "Easy to swim against"),
                ("Moderate", "Some effort required"),
                ("Strong", "Experienced divers only"),
            ],
            Facet::MaxDepth => &[
                ("Shallow (<18m/60ft)", "Suitable for all certification levels"),
                ("Medium (18-30m/60-100ft)", "Advanced certification recommended"),
                ("Deep (>30m/100ft)", "Technical diving certification required"),
            ],
        }
    }
}

/// the preferences submitted with one request. every facet is multi-select.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreferenceSet {
    pub experience_level: Vec<String>,
    pub interests: Vec<String>,
    pub season: Vec<String>,
    pub regions: Vec<String>,
    pub water_temperature: Vec<String>,
    pub visibility: Vec<String>,
    pub current_strength: Vec<String>,
    pub max_depth: Vec<String>,
}

impl PreferenceSet {
    /// the preferences used for the very first (cached) recommendation.
    pub fn starter() -> Self {
        Self {
            experience_level: vec!["Open Water".into()],
            interests: vec!["Coral Reefs".into(), "Marine Life".into()],
            season: vec!["July-August".into()],
            ..Default::default()
        }
    }

    pub fn values(&self, facet: Facet) -> &[String] {
        match facet {
            Facet::ExperienceLevel => &self.experience_level,
            Facet::Interests => &self.interests,
            Facet::Season => &self.season,
            Facet::Region => &self.regions,
            Facet::WaterTemperature => &self.water_temperature,
            Facet::Visibility => &self.visibility,
            Facet::CurrentStrength => &self.current_strength,
            Facet::MaxDepth => &self.max_depth,
        }
    }

    fn values_mut(&mut self, facet: Facet) -> &mut Vec<String> {
        match facet {
            Facet::ExperienceLevel => &mut self.experience_level,
            Facet::Interests => &mut self.interests,
            Facet::Season => &mut self.season,
            Facet::Region => &mut self.regions,
            Facet::WaterTemperature => &mut self.water_temperature,
            Facet::Visibility => &mut self.visibility,
            Facet::CurrentStrength => &mut self.current_strength,
            Facet::MaxDepth => &mut self.max_depth,
        }
    }

    pub fn contains(&self, facet: Facet, value: &str) -> bool {
        self.values(facet).iter().any(|v| v == value)
    }

    /// add the value if absent, remove it if present.
    pub fn toggle(&mut self, facet: Facet, value: impl Into<String>) {
        let value = value.into();
        let values = self.values_mut(facet);
        if let Some(idx) = values.iter().position(|v| *v == value) {
            values.remove(idx);
        } else {
            values.push(value);
        }
    }

    pub fn set(&mut self, facet: Facet, values: Vec<String>) {
        *self.values_mut(facet) = values;
    }

    pub fn validate(&self) -> Result<(), PreferenceError> {
        let missing: Vec<Facet> = Facet::REQUIRED
            .into_iter()
            .filter(|f| self.values(*f).iter().all(|v| v.trim().is_empty()))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PreferenceError::Incomplete(missing))
        }
    }
}

/// travel seasons worth suggesting at `latitude` when planning on `today`.
///
/// late spring through early autumn is prime diving in either hemisphere; outside it
/// the next good window is suggested for future planning.
pub fn recommended_seasons(latitude: f64, today: impl Datelike) -> Vec<&'static str> {
    let seasons: Vec<&'static str> = Facet::Season.options().iter().map(|(name, _)| *name).collect();
    let month = today.month0();
    if latitude > 0.0 {
        if (4..=9).contains(&month) {
            seasons[2..4].to_vec()
        } else {
            vec![seasons[2]]
        }
    } else if month >= 10 || month <= 3 {
        vec![seasons[5], seasons[0]]
    } else {
        vec![seasons[5]]
    }
}

/// [`PreferenceSet::starter`] with its season replaced by [`recommended_seasons`].
pub fn starter_for(latitude: f64, today: impl Datelike) -> PreferenceSet {
    let mut set = PreferenceSet::starter();
    set.set(
        Facet::Season,
        recommended_seasons(latitude, today).into_iter().map(String::from).collect(),
    );
    set
}
