//! per-browser user id, recommendation history, favorite destinations and the cached
//! starter recommendation. all of it lives in an injected [`KeyValueStore`].

use std::sync::Arc;

use bevy::log::{debug, warn};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::preferences::PreferenceSet;
use crate::storage::{KeyValueStore, load_json, save_json};

pub const USER_ID_KEY: &str = "diveUserID";
pub const CACHE_KEY: &str = "initialRecommendations";

/// how long the cached starter recommendation stays fresh.
pub fn cache_ttl() -> TimeDelta {
    TimeDelta::hours(24)
}

/// the stored user id, created on first use.
pub fn user_id(store: &dyn KeyValueStore, now: DateTime<Utc>) -> String {
    if let Some(existing) = store.get(USER_ID_KEY).filter(|id| !id.is_empty()) {
        return existing;
    }
    let id = format!("user_{}_{}", now.timestamp_millis(), Uuid::new_v4().simple());
    if let Err(err) = store.set(USER_ID_KEY, &id) {
        warn!(target: "bevy_dive_buddy", "could not persist user id: {}", err);
    }
    id
}

/// millisecond id, bumped past `taken` so two entries written in the same millisecond differ.
fn next_id(now: DateTime<Utc>, taken: impl Iterator<Item = i64>) -> i64 {
    let max = taken.max().unwrap_or(i64::MIN);
    now.timestamp_millis().max(max.saturating_add(1))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    pub preferences: PreferenceSet,
    pub recommendation: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
}

/// newest-first list of completed recommendations.
#[derive(Clone)]
pub struct RecommendationHistory {
    store: Arc<dyn KeyValueStore>,
    user_id: String,
}

impl RecommendationHistory {
    pub fn new(store: Arc<dyn KeyValueStore>, user_id: impl Into<String>) -> Self {
        Self { store, user_id: user_id.into() }
    }

    fn key(&self) -> String {
        format!("recommendations_{}", self.user_id)
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        load_json(self.store.as_ref(), &self.key())
    }

    pub fn add(
        &self,
        preferences: PreferenceSet,
        recommendation: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<HistoryEntry, StorageError> {
        let mut entries = self.entries();
        let entry = HistoryEntry {
            id: next_id(now, entries.iter().map(|e| e.id)),
            preferences,
            recommendation: recommendation.into(),
            timestamp: now,
            user_id: self.user_id.clone(),
        };
        entries.insert(0, entry.clone());
        save_json(self.store.as_ref(), &self.key(), &entries)?;
        debug!(target: "bevy_dive_buddy", "history: {} entries", entries.len());
        Ok(entry)
    }

    pub fn clear(&self) {
        self.store.remove(&self.key());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteEntry {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
}

/// saved locations, unique by title.
#[derive(Clone)]
pub struct FavoriteDestinations {
    store: Arc<dyn KeyValueStore>,
    user_id: String,
}

impl FavoriteDestinations {
    pub fn new(store: Arc<dyn KeyValueStore>, user_id: impl Into<String>) -> Self {
        Self { store, user_id: user_id.into() }
    }

    fn key(&self) -> String {
        format!("favorites_{}", self.user_id)
    }

    pub fn entries(&self) -> Vec<FavoriteEntry> {
        load_json(self.store.as_ref(), &self.key())
    }

    pub fn is_favorite(&self, title: &str) -> bool {
        self.entries().iter().any(|f| f.title == title)
    }

    /// add a favorite; an existing entry with the same title is returned unchanged.
    pub fn add(
        &self,
        title: impl Into<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<FavoriteEntry, StorageError> {
        let title = title.into();
        let mut entries = self.entries();
        if let Some(existing) = entries.iter().find(|f| f.title == title) {
            return Ok(existing.clone());
        }
        let entry = FavoriteEntry {
            id: next_id(now, entries.iter().map(|f| f.id)),
            title,
            content: content.into(),
            timestamp: now,
            user_id: self.user_id.clone(),
        };
        entries.push(entry.clone());
        save_json(self.store.as_ref(), &self.key(), &entries)?;
        Ok(entry)
    }

    /// returns whether anything was removed.
    pub fn remove(&self, id: i64) -> Result<bool, StorageError> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|f| f.id != id);
        if entries.len() == before {
            return Ok(false);
        }
        save_json(self.store.as_ref(), &self.key(), &entries)?;
        Ok(true)
    }

    /// add when absent, remove when present. returns whether the title is now a favorite.
    pub fn toggle(
        &self,
        title: &str,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        match self.entries().into_iter().find(|f| f.title == title) {
            Some(existing) => {
                self.remove(existing.id)?;
                Ok(false)
            }
            None => {
                self.add(title, content, now)?;
                Ok(true)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedRecommendation {
    recommendations: String,
    /// unix millis
    timestamp: i64,
}

/// the most recent recommendation, reused for 24 hours instead of re-querying on startup.
#[derive(Clone)]
pub struct RecommendationCache {
    store: Arc<dyn KeyValueStore>,
}

impl RecommendationCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self, recommendation: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        save_json(
            self.store.as_ref(),
            CACHE_KEY,
            &CachedRecommendation {
                recommendations: recommendation.to_string(),
                timestamp: now.timestamp_millis(),
            },
        )
    }

    /// the cached text while fresh; stale or unreadable entries are evicted.
    pub fn load(&self, now: DateTime<Utc>) -> Option<String> {
        let raw = self.store.get(CACHE_KEY)?;
        let cached = match serde_json::from_str::<CachedRecommendation>(&raw) {
            Ok(c) => c,
            Err(err) => {
                warn!(target: "bevy_dive_buddy", "evicting unreadable cached recommendation: {}", err);
                self.store.remove(CACHE_KEY);
                return None;
            }
        };
        let age = now.timestamp_millis().saturating_sub(cached.timestamp);
        if age < cache_ttl().num_milliseconds() {
            Some(cached.recommendations)
        } else {
            debug!(target: "bevy_dive_buddy", "cached recommendation expired ({} ms old)", age);
            self.store.remove(CACHE_KEY);
            None
        }
    }
}
