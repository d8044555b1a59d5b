//! prompt construction and the outbound chat-completion body.

use serde::Serialize;

use crate::preferences::{Facet, PreferenceSet};

pub const RECOMMENDATION_SYSTEM_PROMPT: &str = "\
You are a diving expert that recommends the best diving destinations. \
Your answers are in Markdown with the following format:
## <Title>
---
### 1. <Dive Location>
<Details as list>
---
### 2. <Dive Location>
<Details as list>
---
...
---
**Summary:** <Summary>";

pub const ADDITIONAL_INFO_SYSTEM_PROMPT: &str =
    "You are a diving expert that provides detailed additional information about diving destinations.";

const RECOMMENDATION_DETAILS: &str = "\
Please provide detailed recommendations including:
- Specific dive sites
- Best time to visit
- Marine life to expect
- Required certification level
- Depth range of the dives
- Water temperature
- Any special considerations";

const BEGINNER_NOTE: &str =
    "If Beginner is selected, make sure you connect the user with some Dive Centers.";

const ADDITIONAL_INFO_TOPICS: &str = "\
Please include additional information about:
- Local diving regulations and requirements
- Typical visibility conditions
- Common weather patterns
- Local dive operators and facilities
- Transportation and logistics
- Accommodation options
- Best diving spots in the area
- Alternative diving sites nearby
- Local marine life seasonal patterns
- Safety considerations and emergency facilities";

/// user prompt for a recommendation request. deterministic for a given preference set.
pub fn recommendation_prompt(preferences: &PreferenceSet) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str(
        "As a diving expert, please recommend the best diving destinations based on these preferences:\n",
    );
    // Facet::ALL is already prompt order: required facets first
    for facet in Facet::ALL {
        let values = preferences.values(facet);
        if values.is_empty() && !facet.is_required() {
            continue;
        }
        out.push_str(facet.label());
        out.push_str(": ");
        out.push_str(&values.join(", "));
        out.push('\n');
    }
    out.push('\n');
    out.push_str(RECOMMENDATION_DETAILS);
    out.push_str("\n\n");
    out.push_str(BEGINNER_NOTE);
    out.push('\n');
    out
}

/// user prompt asking for more detail about one recommended location.
pub fn additional_info_prompt(title: &str, content: &str) -> String {
    format!(
        "Based on the following diving destination information, please provide additional details that would be helpful for divers:\n\n\
         Title: {title}\n\n\
         Current Information:\n{content}\n\n\
         {ADDITIONAL_INFO_TOPICS}\n"
    )
}

/// what a request asks the model for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Recommendations(PreferenceSet),
    AdditionalInfo { title: String, content: String },
}

impl RequestKind {
    pub fn preferences(&self) -> Option<&PreferenceSet> {
        match self {
            RequestKind::Recommendations(p) => Some(p),
            RequestKind::AdditionalInfo { .. } => None,
        }
    }

    pub fn messages(&self) -> Vec<WireMessage> {
        let (system, user) = match self {
            RequestKind::Recommendations(p) => {
                (RECOMMENDATION_SYSTEM_PROMPT, recommendation_prompt(p))
            }
            RequestKind::AdditionalInfo { title, content } => {
                (ADDITIONAL_INFO_SYSTEM_PROMPT, additional_info_prompt(title, content))
            }
        };
        vec![WireMessage::system(system), WireMessage::user(user)]
    }

    pub fn to_request(&self, model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: self.messages(),
            stream: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: String,
}

impl WireMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system", content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user", content: content.into() }
    }
}

/// `POST /v1/chat/completions` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
}
