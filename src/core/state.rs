use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prebuilt voices the Gemini speech models accept. Custom names are allowed
/// too, this list only feeds the setup prompt.
pub const GEMINI_VOICES: &[&str] = &[
    "Puck",
    "Charon",
    "Kore",
    "Fenrir",
    "Aoede",
    "Zephyr",
    "Orus",
    "Autonoe",
    "Umbriel",
    "Erinome",
    "Laomedeia",
    "Achird",
    "Sadachbia",
    "Leda",
    "Callirrhoe",
    "Enceladus",
    "Algieba",
    "Algenib",
    "Achernar",
    "Schedar",
    "Gacrux",
    "Zubenelgenubi",
    "Vindemiatrix",
    "Sadaltager",
    "Sulafat",
    "Iapetus",
    "Despina",
    "Rasalgethi",
    "Alnilam",
    "Pulcherrima",
];

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct CharacterProfile {
    pub voice: String,
    /// Free-form direction prepended to the line, e.g. "Speak in a whisper".
    #[serde(default)]
    pub style: Option<String>,
}

impl CharacterProfile {
    pub fn style_instruction(&self) -> &str {
        self.style.as_deref().map(str::trim).unwrap_or("")
    }
}

/// Read-only view of the character manager. The pipeline never owns or edits
/// profiles, it only looks them up by name.
pub trait CharacterDirectory: Send + Sync {
    fn lookup(&self, name: &str) -> Option<CharacterProfile>;
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(transparent)]
pub struct CharacterMap {
    pub characters: HashMap<String, CharacterProfile>,
}

impl CharacterMap {
    pub fn insert(&mut self, name: impl Into<String>, voice: impl Into<String>, style: Option<&str>) {
        self.characters.insert(
            name.into(),
            CharacterProfile {
                voice: voice.into(),
                style: style.map(str::to_string),
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }
}

impl CharacterDirectory for CharacterMap {
    fn lookup(&self, name: &str) -> Option<CharacterProfile> {
        self.characters.get(name).cloned()
    }
}
