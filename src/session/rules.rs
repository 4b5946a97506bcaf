//! Per-session game rules
//!
//! A closed set of integer rules indexed by [`GameRule`]. Only the session
//! owner may change them, and the new value is broadcast to every member.

use std::time::Duration;

/// Rule keys, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum GameRule {
    NumCaptains = 0,
    NumSaboteursMax,
    NumPlayers,
    NumMonsters,
    SaboteurMinChance,
    SaboteurMaxChance,
    NumPuzzlesPerMissionMax,
    NumMissions,
    CameraHackCooldown,
    DoorHackCooldown,
    NumHackStages,
    PlayerSpeedMod,
    MonsterSpeedMod,
    MonsterHp,
    PlayerHp,
    SaboteurHp,
    CaptainHp,
    MonsterDamage,
    EnvironmentDamage,
    /// Match duration in seconds
    GameTime,
    MissionMaxTime,
    MissionMinTime,
    DoorPoweredOpenTime,
    DoorPoweredCloseTime,
    DoorWeldingTime,
    DoorCuttingTime,
    DoorPryOpenTime,
}

impl GameRule {
    pub const COUNT: usize = 27;

    pub const ALL: [GameRule; GameRule::COUNT] = [
        GameRule::NumCaptains,
        GameRule::NumSaboteursMax,
        GameRule::NumPlayers,
        GameRule::NumMonsters,
        GameRule::SaboteurMinChance,
        GameRule::SaboteurMaxChance,
        GameRule::NumPuzzlesPerMissionMax,
        GameRule::NumMissions,
        GameRule::CameraHackCooldown,
        GameRule::DoorHackCooldown,
        GameRule::NumHackStages,
        GameRule::PlayerSpeedMod,
        GameRule::MonsterSpeedMod,
        GameRule::MonsterHp,
        GameRule::PlayerHp,
        GameRule::SaboteurHp,
        GameRule::CaptainHp,
        GameRule::MonsterDamage,
        GameRule::EnvironmentDamage,
        GameRule::GameTime,
        GameRule::MissionMaxTime,
        GameRule::MissionMinTime,
        GameRule::DoorPoweredOpenTime,
        GameRule::DoorPoweredCloseTime,
        GameRule::DoorWeldingTime,
        GameRule::DoorCuttingTime,
        GameRule::DoorPryOpenTime,
    ];

    pub fn from_index(index: u16) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(self) -> u16 {
        self as u16
    }

    pub fn default_value(self) -> i32 {
        match self {
            GameRule::NumCaptains => 1,
            GameRule::NumSaboteursMax => 1,
            GameRule::NumPlayers => 8,
            GameRule::NumMonsters => 1,
            GameRule::SaboteurMinChance => 10,
            GameRule::SaboteurMaxChance => 50,
            GameRule::NumPuzzlesPerMissionMax => 3,
            GameRule::NumMissions => 5,
            GameRule::CameraHackCooldown => 30,
            GameRule::DoorHackCooldown => 30,
            GameRule::NumHackStages => 3,
            GameRule::PlayerSpeedMod => 100,
            GameRule::MonsterSpeedMod => 100,
            GameRule::MonsterHp => 100,
            GameRule::PlayerHp => 100,
            GameRule::SaboteurHp => 100,
            GameRule::CaptainHp => 120,
            GameRule::MonsterDamage => 25,
            GameRule::EnvironmentDamage => 10,
            GameRule::GameTime => 600,
            GameRule::MissionMaxTime => 180,
            GameRule::MissionMinTime => 60,
            GameRule::DoorPoweredOpenTime => 2,
            GameRule::DoorPoweredCloseTime => 2,
            GameRule::DoorWeldingTime => 8,
            GameRule::DoorCuttingTime => 6,
            GameRule::DoorPryOpenTime => 4,
        }
    }
}

/// Indexed rule values owned by one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    values: [i32; GameRule::COUNT],
}

impl RuleSet {
    pub fn new() -> Self {
        let mut values = [0; GameRule::COUNT];
        for rule in GameRule::ALL {
            values[rule as usize] = rule.default_value();
        }
        Self { values }
    }

    pub fn get(&self, rule: GameRule) -> i32 {
        self.values[rule as usize]
    }

    pub fn set(&mut self, rule: GameRule, value: i32) {
        self.values[rule as usize] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (GameRule, i32)> + '_ {
        GameRule::ALL.iter().map(move |r| (*r, self.values[*r as usize]))
    }

    /// Match length from the `GameTime` rule, at least one second
    pub fn game_duration(&self) -> Duration {
        Duration::from_secs(self.get(GameRule::GameTime).max(1) as u64)
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}
