//! Filler clip library
//!
//! Fillers are short pre-synthesized µ-law clips ("let me check that for
//! you…") played to mask collaborator latency. Clips are generated offline
//! with the same TTS the agent speaks with and laid out on disk as
//! `<dir>/<language-tag>/<category>/<n>.ulaw`. Greetings live beside them
//! under `<dir>/greetings/<language-tag>/<role>.ulaw`. The library is
//! read-only after startup.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rand::prelude::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{Language, PeerRole};

/// Closed set of filler categories, one per slow operation family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillerCategory {
    Lookup,
    ShiftCancel,
    Book,
    Generic,
    DelayLookup,
    CalendarUpdate,
    CalendarFetch,
    Confirm,
    Reschedule,
    Decline,
}

impl FillerCategory {
    pub const ALL: [FillerCategory; 10] = [
        FillerCategory::Lookup,
        FillerCategory::ShiftCancel,
        FillerCategory::Book,
        FillerCategory::Generic,
        FillerCategory::DelayLookup,
        FillerCategory::CalendarUpdate,
        FillerCategory::CalendarFetch,
        FillerCategory::Confirm,
        FillerCategory::Reschedule,
        FillerCategory::Decline,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            FillerCategory::Lookup => "lookup",
            FillerCategory::ShiftCancel => "shift_cancel",
            FillerCategory::Book => "book",
            FillerCategory::Generic => "generic",
            FillerCategory::DelayLookup => "delay_lookup",
            FillerCategory::CalendarUpdate => "calendar_update",
            FillerCategory::CalendarFetch => "calendar_fetch",
            FillerCategory::Confirm => "confirm",
            FillerCategory::Reschedule => "reschedule",
            FillerCategory::Decline => "decline",
        }
    }
}

impl std::fmt::Display for FillerCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One codec-ready clip.
#[derive(Clone)]
pub struct FillerClip {
    pub id: String,
    pub language: Language,
    pub category: FillerCategory,
    /// µ-law 8kHz bytes, injectable into the outbound frame queue as-is.
    pub payload: Vec<u8>,
}

/// In-memory clip registry.
pub struct FillerLibrary {
    clips: HashMap<(Language, FillerCategory), Vec<FillerClip>>,
    greetings: HashMap<(Language, PeerRole), Vec<u8>>,
}

const LANGUAGES: [Language; 4] = [
    Language::English,
    Language::German,
    Language::Hindi,
    Language::HindiMixed,
];

impl FillerLibrary {
    /// Load every clip under `dir`. Missing categories are tolerated (the
    /// bridge falls back to live TTS); a missing directory yields an empty
    /// library so the agent still runs in fresh environments.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut clips: HashMap<(Language, FillerCategory), Vec<FillerClip>> = HashMap::new();
        let mut greetings = HashMap::new();

        if !dir.exists() {
            warn!(dir = %dir.display(), "filler directory missing, playing no fillers");
            return Ok(Self { clips, greetings });
        }

        for language in LANGUAGES {
            for category in FillerCategory::ALL {
                let cat_dir = dir.join(language.tag()).join(category.dir_name());
                if !cat_dir.is_dir() {
                    continue;
                }
                let mut loaded = Vec::new();
                for entry in std::fs::read_dir(&cat_dir)
                    .with_context(|| format!("reading {}", cat_dir.display()))?
                {
                    let path = entry?.path();
                    if path.extension().and_then(|ext| ext.to_str()) != Some("ulaw") {
                        continue;
                    }
                    let payload = std::fs::read(&path)
                        .with_context(|| format!("reading clip {}", path.display()))?;
                    if payload.is_empty() {
                        continue;
                    }
                    loaded.push(FillerClip {
                        id: path
                            .file_stem()
                            .map(|stem| stem.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        language,
                        category,
                        payload,
                    });
                }
                if !loaded.is_empty() {
                    debug!(language = language.tag(), category = %category, count = loaded.len(), "fillers loaded");
                    clips.insert((language, category), loaded);
                }
            }

            for role in [PeerRole::Teammate, PeerRole::Customer, PeerRole::Unknown] {
                let path = dir
                    .join("greetings")
                    .join(language.tag())
                    .join(format!("{role}.ulaw"));
                if let Ok(payload) = std::fs::read(&path) {
                    if !payload.is_empty() {
                        greetings.insert((language, role), payload);
                    }
                }
            }
        }

        info!(
            categories = clips.len(),
            greetings = greetings.len(),
            "filler library ready"
        );
        Ok(Self { clips, greetings })
    }

    /// Empty library, used in tests and bare environments.
    pub fn empty() -> Self {
        Self {
            clips: HashMap::new(),
            greetings: HashMap::new(),
        }
    }

    /// Library built from in-memory clips, used in tests.
    pub fn from_clips(clips: Vec<FillerClip>) -> Self {
        let mut map: HashMap<(Language, FillerCategory), Vec<FillerClip>> = HashMap::new();
        for clip in clips {
            map.entry((clip.language, clip.category)).or_default().push(clip);
        }
        Self {
            clips: map,
            greetings: HashMap::new(),
        }
    }

    /// Pick a random clip for the category; falls back to English, then to
    /// the generic category, before giving up.
    pub fn pick(&self, language: Language, category: FillerCategory) -> Option<&FillerClip> {
        let mut rng = rand::rng();
        self.clips
            .get(&(language, category))
            .or_else(|| self.clips.get(&(Language::English, category)))
            .or_else(|| self.clips.get(&(language, FillerCategory::Generic)))
            .or_else(|| self.clips.get(&(Language::English, FillerCategory::Generic)))
            .and_then(|pool| pool.choose(&mut rng))
    }

    /// Pre-rendered greeting for a caller role, if one was generated.
    pub fn greeting(&self, language: Language, role: PeerRole) -> Option<&[u8]> {
        self.greetings
            .get(&(language, role))
            .or_else(|| self.greetings.get(&(Language::English, role)))
            .map(|payload| payload.as_slice())
    }
}
