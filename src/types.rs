//! Core value types shared across the redemption engine.
//!
//! Codes, games and platforms are parsed once at the boundary (CLI, store rows,
//! feed entries) and flow through the engine as the strongly-typed values below.

use crate::error::RedeemError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of alphanumeric characters in a canonical code.
pub const CODE_LENGTH: usize = 25;
/// Characters per dash-separated block.
pub const CODE_BLOCK: usize = 5;

/// A code in canonical form: five dash-separated blocks of five uppercase
/// alphanumeric characters (`ABCDE-FGHIJ-KLMNO-PQRST-UVWXY`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NormalizedCode(String);

impl NormalizedCode {
    /// Canonicalize a raw code string.
    ///
    /// Every character that is not an ASCII letter or digit is treated as a
    /// separator and dropped; what remains must be exactly 25 characters.
    pub fn parse(raw: &str) -> Result<Self, RedeemError> {
        let stripped: String = raw
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if stripped.len() != CODE_LENGTH {
            return Err(RedeemError::InvalidCodeFormat(raw.to_string()));
        }

        let blocks: Vec<&str> = (0..CODE_LENGTH)
            .step_by(CODE_BLOCK)
            .map(|start| &stripped[start..start + CODE_BLOCK])
            .collect();

        Ok(Self(blocks.join("-")))
    }

    /// Whether `raw` would normalize successfully.
    pub fn looks_valid(raw: &str) -> bool {
        Self::parse(raw).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NormalizedCode {
    type Error = RedeemError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NormalizedCode> for String {
    fn from(code: NormalizedCode) -> Self {
        code.0
    }
}

/// Games known to the rewards platform, in canonical probing priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Game {
    Bl4,
    Bl3,
    Blps,
    Bl2,
    Bl1,
    Ttw,
    Gdfll,
}

impl Game {
    /// All games in canonical priority order.
    pub const ALL: [Game; 7] = [
        Game::Bl4,
        Game::Bl3,
        Game::Blps,
        Game::Bl2,
        Game::Bl1,
        Game::Ttw,
        Game::Gdfll,
    ];

    /// Short canonical identifier used as the storage key.
    pub fn short(&self) -> &'static str {
        match self {
            Game::Bl4 => "bl4",
            Game::Bl3 => "bl3",
            Game::Blps => "blps",
            Game::Bl2 => "bl2",
            Game::Bl1 => "bl1",
            Game::Ttw => "ttw",
            Game::Gdfll => "gdfll",
        }
    }

    /// Display name as the rewards platform and the codes feed spell it.
    pub fn display_name(&self) -> &'static str {
        match self {
            Game::Bl4 => "Borderlands 4",
            Game::Bl3 => "Borderlands 3",
            Game::Blps => "Borderlands: The Pre-Sequel",
            Game::Bl2 => "Borderlands 2",
            Game::Bl1 => "Borderlands: Game of the Year Edition",
            Game::Ttw => "Tiny Tina's Wonderlands",
            Game::Gdfll => "Godfall",
        }
    }

    /// Resolve a short id or a display name (case-insensitive).
    pub fn from_token(token: &str) -> Option<Game> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        Game::ALL.into_iter().find(|game| {
            game.short().eq_ignore_ascii_case(token)
                || game.display_name().eq_ignore_ascii_case(token)
        })
    }

    /// Position in the canonical priority order.
    pub fn rank(&self) -> usize {
        Game::ALL.iter().position(|g| g == self).unwrap_or(usize::MAX)
    }
}

impl fmt::Display for Game {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Platforms a code can be redeemed on, in canonical priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Epic,
    Steam,
    Xboxlive,
    Psn,
    Nintendo,
    Stadia,
}

impl Platform {
    /// All platforms in canonical priority order.
    pub const ALL: [Platform; 6] = [
        Platform::Epic,
        Platform::Steam,
        Platform::Xboxlive,
        Platform::Psn,
        Platform::Nintendo,
        Platform::Stadia,
    ];

    pub fn short(&self) -> &'static str {
        match self {
            Platform::Epic => "epic",
            Platform::Steam => "steam",
            Platform::Xboxlive => "xboxlive",
            Platform::Psn => "psn",
            Platform::Nintendo => "nintendo",
            Platform::Stadia => "stadia",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Epic => "Epic Games",
            Platform::Steam => "Steam",
            Platform::Xboxlive => "Xbox Live",
            Platform::Psn => "PSN",
            Platform::Nintendo => "Nintendo",
            Platform::Stadia => "Stadia",
        }
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self {
            Platform::Epic => &["epic games", "egs"],
            Platform::Steam => &[],
            Platform::Xboxlive => &["xbox", "xbox live"],
            Platform::Psn => &["playstation", "ps4", "ps5"],
            Platform::Nintendo => &["switch"],
            Platform::Stadia => &[],
        }
    }

    /// Resolve a short id, display name or alias (case-insensitive).
    pub fn from_token(token: &str) -> Option<Platform> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        Platform::ALL.into_iter().find(|platform| {
            platform.short().eq_ignore_ascii_case(token)
                || platform.display_name().eq_ignore_ascii_case(token)
                || platform
                    .aliases()
                    .iter()
                    .any(|alias| alias.eq_ignore_ascii_case(token))
        })
    }

    pub fn rank(&self) -> usize {
        Platform::ALL.iter().position(|p| p == self).unwrap_or(usize::MAX)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Platform applicability of a source record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformScope {
    /// Applies to every requested platform.
    Universal,
    Specific(Platform),
}

impl PlatformScope {
    /// Parse a platform token from source data.
    ///
    /// `universal` and `manual` mean "all platforms"; so does a missing or
    /// unrecognized token, which is logged and then treated as universal.
    pub fn from_token(token: Option<&str>) -> PlatformScope {
        let Some(raw) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return PlatformScope::Universal;
        };
        if raw.eq_ignore_ascii_case("universal") || raw.eq_ignore_ascii_case("manual") {
            return PlatformScope::Universal;
        }
        match Platform::from_token(raw) {
            Some(platform) => PlatformScope::Specific(platform),
            None => {
                tracing::debug!("Unrecognized platform token '{}'; treating as universal", raw);
                PlatformScope::Universal
            }
        }
    }

    /// Storage spelling (`universal` or the platform short id).
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformScope::Universal => "universal",
            PlatformScope::Specific(platform) => platform.short(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_code_with_separators() {
        let code = NormalizedCode::parse("abcde fghij_klmno.pqrst/uvwxy").unwrap();
        assert_eq!(code.as_str(), "ABCDE-FGHIJ-KLMNO-PQRST-UVWXY");
    }

    #[test]
    fn test_normalize_code_is_idempotent() {
        let raws = [
            "ABCDE-FGHIJ-KLMNO-PQRST-UVWXY",
            "  k9x3t h2w5b-jj3tb-3jbbt-9b3bz ",
            "1234512345123451234512345",
        ];
        for raw in raws {
            let once = NormalizedCode::parse(raw).unwrap();
            let twice = NormalizedCode::parse(once.as_str()).unwrap();
            assert_eq!(once, twice);

            let blocks: Vec<&str> = once.as_str().split('-').collect();
            assert_eq!(blocks.len(), 5);
            assert!(blocks.iter().all(|b| b.len() == 5));
        }
    }

    #[test]
    fn test_normalize_code_rejects_wrong_length() {
        assert!(matches!(
            NormalizedCode::parse("ABCDE-FGHIJ-KLMNO-PQRST"),
            Err(RedeemError::InvalidCodeFormat(_))
        ));
        assert!(NormalizedCode::parse("").is_err());
        assert!(NormalizedCode::parse("ABCDE-FGHIJ-KLMNO-PQRST-UVWXYZ").is_err());
    }

    #[test]
    fn test_game_tokens() {
        assert_eq!(Game::from_token("bl3"), Some(Game::Bl3));
        assert_eq!(Game::from_token("Borderlands 3"), Some(Game::Bl3));
        assert_eq!(Game::from_token("tiny tina's wonderlands"), Some(Game::Ttw));
        assert_eq!(Game::from_token("Halo"), None);
        assert!(Game::Bl4.rank() < Game::Gdfll.rank());
    }

    #[test]
    fn test_platform_scope_tokens() {
        assert_eq!(PlatformScope::from_token(Some("Universal")), PlatformScope::Universal);
        assert_eq!(PlatformScope::from_token(None), PlatformScope::Universal);
        assert_eq!(
            PlatformScope::from_token(Some("Xbox")),
            PlatformScope::Specific(Platform::Xboxlive)
        );
        assert_eq!(PlatformScope::from_token(Some("dreamcast")), PlatformScope::Universal);
    }
}
