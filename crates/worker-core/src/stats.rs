//! Game statistics as reported to the coordinator.

use serde::{Deserialize, Serialize};

/// Cumulative results for one task. The pentanomial histogram counts
/// paired-game outcomes (`LL, LD, LW/DD, WD, WW`), so every pair
/// accounts for exactly two of the wins/losses/draws.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStats {
    #[serde(default)]
    pub wins: u64,
    #[serde(default)]
    pub losses: u64,
    #[serde(default)]
    pub draws: u64,
    #[serde(default)]
    pub crashes: u64,
    #[serde(default)]
    pub time_losses: u64,
    #[serde(default)]
    pub pentanomial: [u64; 5],
}

impl GameStats {
    pub fn total_games(&self) -> u64 {
        self.wins + self.losses + self.draws
    }

    pub fn pentanomial_pairs(&self) -> u64 {
        self.pentanomial.iter().sum()
    }

    /// Every committed update must satisfy
    /// `2 * sum(pentanomial) == wins + losses + draws`.
    pub fn is_consistent(&self) -> bool {
        2 * self.pentanomial_pairs() == self.total_games()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_consistent() {
        assert!(GameStats::default().is_consistent());
    }

    #[test]
    fn consistency_tracks_pentanomial_pairing() {
        let stats = GameStats {
            wins: 248,
            losses: 266,
            draws: 166,
            pentanomial: [43, 61, 144, 55, 37],
            ..GameStats::default()
        };
        assert_eq!(stats.total_games(), 680);
        assert_eq!(stats.pentanomial_pairs(), 340);
        assert!(stats.is_consistent());

        let broken = GameStats {
            wins: stats.wins + 1,
            ..stats
        };
        assert!(!broken.is_consistent());
    }

    #[test]
    fn missing_fields_deserialize_to_zero() {
        let stats: GameStats = serde_json::from_str(r#"{"wins": 4, "losses": 2, "draws": 2}"#).unwrap();
        assert_eq!(stats.wins, 4);
        assert_eq!(stats.crashes, 0);
        assert_eq!(stats.time_losses, 0);
        assert_eq!(stats.pentanomial, [0; 5]);
        assert!(stats.is_consistent());
    }
}
