use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Fixed palette a tag colour is chosen from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagColor {
    Red,
    Orange,
    Yellow,
    Green,
    Teal,
    #[default]
    Blue,
    Purple,
    Pink,
}

impl TagColor {
    pub const ALL: [TagColor; 8] = [
        TagColor::Red,
        TagColor::Orange,
        TagColor::Yellow,
        TagColor::Green,
        TagColor::Teal,
        TagColor::Blue,
        TagColor::Purple,
        TagColor::Pink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TagColor::Red => "red",
            TagColor::Orange => "orange",
            TagColor::Yellow => "yellow",
            TagColor::Green => "green",
            TagColor::Teal => "teal",
            TagColor::Blue => "blue",
            TagColor::Purple => "purple",
            TagColor::Pink => "pink",
        }
    }

    pub fn hex(&self) -> &'static str {
        match self {
            TagColor::Red => "#ef4444",
            TagColor::Orange => "#f97316",
            TagColor::Yellow => "#eab308",
            TagColor::Green => "#22c55e",
            TagColor::Teal => "#14b8a6",
            TagColor::Blue => "#3b82f6",
            TagColor::Purple => "#a855f7",
            TagColor::Pink => "#ec4899",
        }
    }

    /// 24-bit RGB components of [`TagColor::hex`]
    pub fn rgb(&self) -> (u8, u8, u8) {
        let hex = &self.hex()[1..];
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).unwrap_or(0);
        (channel(0), channel(2), channel(4))
    }
}

impl fmt::Display for TagColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown tag color '{0}' (expected one of red, orange, yellow, green, teal, blue, purple, pink)")]
pub struct ParseColorError(pub String);

impl FromStr for TagColor {
    type Err = ParseColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        TagColor::ALL
            .into_iter()
            .find(|c| c.as_str() == lower)
            .ok_or_else(|| ParseColorError(s.to_string()))
    }
}

/// Visual theme persisted with the local preferences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Mono,
    Natural,
    #[default]
    Brutal,
}

impl Theme {
    pub const ALL: [Theme; 3] = [Theme::Mono, Theme::Natural, Theme::Brutal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Mono => "mono",
            Theme::Natural => "natural",
            Theme::Brutal => "brutal",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Theme::Mono => "Clean & minimal",
            Theme::Natural => "Warm & organic",
            Theme::Brutal => "Bold & playful",
        }
    }

    /// Background, foreground and accent colours
    pub fn preview(&self) -> [&'static str; 3] {
        match self {
            Theme::Mono => ["#ffffff", "#0a0a0a", "#dc2626"],
            Theme::Natural => ["#faf6f1", "#3d3229", "#8b7355"],
            Theme::Brutal => ["#fffef0", "#1a1a1a", "#ff6b35"],
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown theme '{0}' (expected mono, natural or brutal)")]
pub struct ParseThemeError(pub String);

impl FromStr for Theme {
    type Err = ParseThemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Theme::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| ParseThemeError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_parse_is_case_insensitive() {
        assert_eq!("Red".parse::<TagColor>(), Ok(TagColor::Red));
        assert_eq!(" teal ".parse::<TagColor>(), Ok(TagColor::Teal));
        assert!("magenta".parse::<TagColor>().is_err());
    }

    #[test]
    fn test_color_rgb_matches_hex() {
        assert_eq!(TagColor::Red.rgb(), (0xef, 0x44, 0x44));
        assert_eq!(TagColor::Blue.rgb(), (0x3b, 0x82, 0xf6));
    }

    #[test]
    fn test_color_serializes_as_name() {
        let json = serde_json::to_string(&TagColor::Purple).unwrap();
        assert_eq!(json, "\"purple\"");
    }

    #[test]
    fn test_theme_default_and_parse() {
        assert_eq!(Theme::default(), Theme::Brutal);
        assert_eq!("natural".parse::<Theme>(), Ok(Theme::Natural));
        assert_eq!(
            "neon".parse::<Theme>(),
            Err(ParseThemeError("neon".to_string()))
        );
    }
}
