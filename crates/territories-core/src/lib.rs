//! Deterministic tick engine for the Territories kinship grid world.
//!
//! The world is a toroidal grid of soil and grass tiles populated by agents
//! that gather crop, mine stone, raise walls, fight, and reproduce. Agents
//! live in a fixed slot table and are rewarded for the growth of their gene
//! family. One [`Territories::step`] call advances exactly one tick; all
//! randomness flows through a single seeded RNG stream, so seeded runs are
//! reproducible byte for byte.

use rand::{Rng, SeedableRng, rngs::SmallRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use territories_bitset::PidSet;
use thiserror::Error;

/// Exponent of the crop growth law `floor(exp(GROWTH_K * days) - 1)`.
pub const GROWTH_K: f64 = 0.071_675_43;
/// Crop growth saturates after this many days.
pub const MAX_GROWTH_DURATION: i32 = 70;
/// Day-of-year offset applied to tick 0.
pub const STARTING_DAY: u32 = 55;
/// Days of summer in one year.
pub const SUMMER_DURATION: u32 = 100;
/// Days of winter in one year.
pub const WINTER_DURATION: u32 = 10;
/// Days in a full summer/winter cycle.
pub const YEAR_LENGTH: u32 = SUMMER_DURATION + WINTER_DURATION;
/// Hit points of a freshly built wall.
pub const WALL_HP_MAX: u16 = 8;
/// Satiation ceiling; agents spawn full.
pub const MAX_SATIATION: i32 = 100;
/// Hit point ceiling reached at adulthood.
pub const MAX_HP: i32 = 3;
/// Food units an agent can carry.
pub const MAX_FOOD_CARRIED: i32 = 150;
/// Stone units an agent can carry.
pub const MAX_STONE_CARRIED: i32 = 10;
/// Food units a tile can store.
pub const MAX_FOOD_STORED: u16 = 150;
/// Stone units in a fresh deposit.
pub const STONE_PER_MINE: u16 = 600;
/// Vision extends this many tiles in every direction.
pub const VISION_RADIUS: i32 = 4;
/// Satiation drained per tick.
pub const METABOLISM_RATE: i32 = 5;
/// Age at which agents become adults and may reproduce.
pub const REPRODUCTION_AGE: u32 = 10;
/// Upper bound on genes per agent.
pub const MAX_GENES: usize = 3;

// The mining stat counts 5 per successful mine action even though a single
// stone changes hands.
const STONE_MINED_PER_TICK: u32 = 5;

/// Discrete action alphabet consumed from the host action buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    MoveUp = 0,
    MoveRight = 1,
    MoveDown = 2,
    MoveLeft = 3,
    Noop = 4,
    Pickup = 5,
    Mine = 6,
    Package = 7,
    BuildWall = 8,
    Attack = 9,
    Reproduce = 10,
}

impl Action {
    /// Decode a raw host action code. Anything out of range acts as `Noop`.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::MoveUp,
            1 => Self::MoveRight,
            2 => Self::MoveDown,
            3 => Self::MoveLeft,
            5 => Self::Pickup,
            6 => Self::Mine,
            7 => Self::Package,
            8 => Self::BuildWall,
            9 => Self::Attack,
            10 => Self::Reproduce,
            _ => Self::Noop,
        }
    }
}

/// Facing of an agent; also the order in which cardinal neighbours are
/// scanned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Up = 0,
    Right = 1,
    Down = 2,
    Left = 3,
}

impl Direction {
    /// All directions in scan order.
    pub const ALL: [Self; 4] = [Self::Up, Self::Right, Self::Down, Self::Left];

    /// Row/column step of one move in this direction.
    #[must_use]
    pub const fn delta(self) -> (i32, i32) {
        match self {
            Self::Up => (-1, 0),
            Self::Right => (0, 1),
            Self::Down => (1, 0),
            Self::Left => (0, -1),
        }
    }

    /// The forward 1x3 arc swept by an attack in this direction.
    #[must_use]
    pub const fn sword_arc(self) -> [(i32, i32); 3] {
        match self {
            Self::Up => [(-1, -1), (-1, 0), (-1, 1)],
            Self::Right => [(-1, 1), (0, 1), (1, 1)],
            Self::Down => [(1, -1), (1, 0), (1, 1)],
            Self::Left => [(-1, -1), (0, -1), (1, -1)],
        }
    }

    #[must_use]
    fn rotated_clockwise(self, steps: usize) -> Self {
        Self::ALL[(self as usize + steps) % 4]
    }

    fn sample(rng: &mut SmallRng) -> Self {
        Self::ALL[rng.random_range(0..4usize)]
    }
}

/// Errors raised while validating configuration and loading the soil map.
#[derive(Debug, Error)]
pub enum WorldInitError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The soil map file could not be read.
    #[error("soil map {path:?}: {source}")]
    MapIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The soil map does not match the configured grid.
    #[error("soil map has {actual} cells, expected {expected}")]
    MapSize { expected: usize, actual: usize },
}

/// Where the read-only soil/grass bitmap comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MapSource {
    /// Every cell is soil.
    #[default]
    Uniform,
    /// Host-supplied row-major bitmap of `width * height` cells.
    Bitmap(Vec<bool>),
    /// Flat row-major byte file (`is_soil_{width}_{height}.bin`), one byte
    /// per cell, loaded verbatim.
    File(PathBuf),
}

/// Static configuration for a Territories world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerritoriesConfig {
    /// Genes per agent, at most [`MAX_GENES`].
    pub n_genes: usize,
    /// Alleles per gene; alleles are stored as bytes.
    pub n_alleles: u16,
    /// Grid width in tiles.
    pub width: usize,
    /// Grid height in tiles.
    pub height: usize,
    /// Capacity of the agent slot table.
    pub max_agents: usize,
    /// Number of agent roles.
    pub n_roles: u16,
    /// Statistics are tracked while `tick < min_ep_length`.
    pub min_ep_length: usize,
    /// Episode budgets are drawn uniformly in `[min_ep_length, max_ep_length)`.
    pub max_ep_length: usize,
    /// Terminal reward when an agent's whole gene family dies out. Negative.
    pub extinction_reward: f32,
    /// Select the log-growth reward kernel instead of the family-size delta.
    pub reward_growth_rate: bool,
    /// Breeding pairs seeded at reset.
    pub initial_pairs: usize,
    /// Episode summaries retained in memory.
    pub history_capacity: usize,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Soil bitmap source.
    pub map: MapSource,
}

impl Default for TerritoriesConfig {
    fn default() -> Self {
        Self {
            n_genes: 3,
            n_alleles: 4,
            width: 96,
            height: 96,
            max_agents: 512,
            n_roles: 2,
            min_ep_length: 512,
            max_ep_length: 576,
            extinction_reward: -2.0,
            reward_growth_rate: false,
            initial_pairs: 4,
            history_capacity: 256,
            rng_seed: None,
            map: MapSource::Uniform,
        }
    }
}

impl TerritoriesConfig {
    fn validate(&self) -> Result<(), WorldInitError> {
        if self.n_genes > MAX_GENES {
            return Err(WorldInitError::InvalidConfig("n_genes must be at most 3"));
        }
        if self.n_alleles == 0 || self.n_alleles > 255 {
            return Err(WorldInitError::InvalidConfig(
                "n_alleles must be between 1 and 255",
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(WorldInitError::InvalidConfig(
                "grid dimensions must be non-zero",
            ));
        }
        if self.width > usize::from(u16::MAX) || self.height > usize::from(u16::MAX) {
            return Err(WorldInitError::InvalidConfig(
                "grid dimensions must fit in 16 bits",
            ));
        }
        if self.max_agents == 0 || self.max_agents > usize::from(u16::MAX) {
            return Err(WorldInitError::InvalidConfig(
                "max_agents must be between 1 and 65535",
            ));
        }
        if self.n_roles == 0 {
            return Err(WorldInitError::InvalidConfig("n_roles must be positive"));
        }
        if self.min_ep_length == 0 {
            return Err(WorldInitError::InvalidConfig(
                "min_ep_length must be positive",
            ));
        }
        if self.max_ep_length <= self.min_ep_length {
            return Err(WorldInitError::InvalidConfig(
                "max_ep_length must exceed min_ep_length",
            ));
        }
        if self.extinction_reward >= 0.0 {
            return Err(WorldInitError::InvalidConfig(
                "extinction_reward must be negative",
            ));
        }
        if self.initial_pairs * 2 > self.max_agents {
            return Err(WorldInitError::InvalidConfig(
                "initial_pairs will not fit in the agent table",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldInitError::InvalidConfig(
                "history_capacity must be positive",
            ));
        }
        Ok(())
    }

    fn load_soil(&self) -> Result<Vec<bool>, WorldInitError> {
        let expected = self.width * self.height;
        match &self.map {
            MapSource::Uniform => Ok(vec![true; expected]),
            MapSource::Bitmap(cells) => {
                if cells.len() != expected {
                    return Err(WorldInitError::MapSize {
                        expected,
                        actual: cells.len(),
                    });
                }
                Ok(cells.clone())
            }
            MapSource::File(path) => {
                let bytes = fs::read(path).map_err(|source| WorldInitError::MapIo {
                    path: path.clone(),
                    source,
                })?;
                if bytes.len() != expected {
                    return Err(WorldInitError::MapSize {
                        expected,
                        actual: bytes.len(),
                    });
                }
                Ok(bytes.iter().map(|&b| b != 0).collect())
            }
        }
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }
}

/// One slot of the fixed agent table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Row on the torus.
    pub r: u16,
    /// Column on the torus.
    pub c: u16,
    /// Current facing.
    pub dir: Direction,
    pub hp: i32,
    pub hp_max: i32,
    /// Drains by [`METABOLISM_RATE`] per tick; death at zero.
    pub satiation: i32,
    /// Age in ticks.
    pub age: u32,
    pub food_carried: i32,
    pub stone_carried: i32,
    pub role: u16,
}

impl Agent {
    fn can_reproduce(&self) -> bool {
        self.age >= REPRODUCTION_AGE && self.satiation > MAX_SATIATION / 2
    }
}

/// Mutable per-cell terrain state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    /// Day-of-year when the crop clock last restarted.
    pub last_harvest: u16,
    /// Packaged food cached on the tile.
    pub stored_food: u16,
    /// Remaining stone in a deposit.
    pub stone: u16,
    /// Wall hit points; zero means no wall.
    pub wall_hp: u16,
}

#[inline]
fn wrap(base: usize, delta: i32, extent: usize) -> usize {
    debug_assert!(extent > 0);
    (base as i32 + delta).rem_euclid(extent as i32) as usize
}

/// Flat row-major terrain store plus the agent position index.
#[derive(Debug, Clone)]
struct TileGrid {
    width: usize,
    height: usize,
    is_soil: Vec<bool>,
    tiles: Vec<Tile>,
    pid_at: Vec<Option<u16>>,
}

impl TileGrid {
    fn new(width: usize, height: usize, is_soil: Vec<bool>) -> Self {
        debug_assert_eq!(is_soil.len(), width * height);
        Self {
            width,
            height,
            is_soil,
            tiles: vec![Tile::default(); width * height],
            pid_at: vec![None; width * height],
        }
    }

    #[inline]
    fn index(&self, r: usize, c: usize) -> usize {
        r * self.width + c
    }

    fn tile(&self, r: usize, c: usize) -> &Tile {
        &self.tiles[self.index(r, c)]
    }

    fn tile_mut(&mut self, r: usize, c: usize) -> &mut Tile {
        let i = self.index(r, c);
        &mut self.tiles[i]
    }

    fn is_soil(&self, r: usize, c: usize) -> bool {
        self.is_soil[self.index(r, c)]
    }

    fn pid_at(&self, r: usize, c: usize) -> Option<u16> {
        self.pid_at[self.index(r, c)]
    }

    fn set_pid(&mut self, r: usize, c: usize, pid: Option<u16>) {
        let i = self.index(r, c);
        self.pid_at[i] = pid;
    }

    fn is_blocked(&self, r: usize, c: usize) -> bool {
        let tile = self.tile(r, c);
        tile.wall_hp > 0 || tile.stone > 0 || self.pid_at(r, c).is_some()
    }

    /// Days of crop growth accumulated on `(r, c)`; zero for anything that
    /// cannot grow right now.
    fn growth_days(&self, is_winter: bool, day: u32, r: usize, c: usize) -> i32 {
        if is_winter || !self.is_soil(r, c) {
            return 0;
        }
        let tile = self.tile(r, c);
        if tile.stored_food > 0 || tile.stone > 0 || tile.wall_hp > 0 {
            return 0;
        }
        (day as i32 - i32::from(tile.last_harvest)).min(MAX_GROWTH_DURATION)
    }

    /// Wipes resources and raises a full-strength wall.
    fn place_wall(&mut self, r: usize, c: usize) {
        let tile = self.tile_mut(r, c);
        if tile.wall_hp > 0 {
            return;
        }
        *tile = Tile {
            wall_hp: WALL_HP_MAX,
            ..Tile::default()
        };
    }

    /// Restart the crop clock on every soil tile (summer return).
    fn restart_crops(&mut self) {
        let Self { is_soil, tiles, .. } = self;
        for (tile, &soil) in tiles.iter_mut().zip(is_soil.iter()) {
            if soil {
                tile.last_harvest = 0;
            }
        }
    }

    fn clear(&mut self) {
        self.tiles.fill(Tile::default());
        self.pid_at.fill(None);
    }
}

/// Slot allocator for the agent table: a free stack for recycled pids, an
/// alive bitset, and a cached alive list rebuilt after every birth/death
/// batch.
#[derive(Debug)]
struct AgentManager {
    free_pids: Vec<u16>,
    alive_pids: Vec<u16>,
    alive: PidSet,
    alive_count: usize,
    next_pid: u16,
    capacity: usize,
}

impl AgentManager {
    fn new(capacity: usize) -> Self {
        Self {
            free_pids: Vec::with_capacity(capacity),
            alive_pids: Vec::with_capacity(capacity),
            alive: PidSet::new(capacity),
            alive_count: 0,
            next_pid: 0,
            capacity,
        }
    }

    fn reset(&mut self, alive_mask: &mut [bool]) {
        alive_mask.fill(false);
        self.free_pids.clear();
        self.alive_pids.clear();
        self.alive.clear();
        self.alive_count = 0;
        self.next_pid = 0;
    }

    /// Claim a slot and initialise its record. Recycled pids are preferred
    /// over fresh ones. Returns `None` when the table is full. The caller
    /// owns the position index and the DNA of the new slot.
    fn spawn(
        &mut self,
        r: u16,
        c: u16,
        agents: &mut [Agent],
        alive_mask: &mut [bool],
        rng: &mut SmallRng,
    ) -> Option<u16> {
        if self.alive_count >= self.capacity {
            return None;
        }
        let pid = match self.free_pids.pop() {
            Some(pid) => pid,
            None => {
                let pid = self.next_pid;
                self.next_pid += 1;
                pid
            }
        };
        alive_mask[usize::from(pid)] = true;
        self.alive.add(usize::from(pid));
        self.alive_count += 1;
        agents[usize::from(pid)] = Agent {
            r,
            c,
            dir: Direction::sample(rng),
            hp: 1,
            hp_max: 1,
            satiation: MAX_SATIATION,
            age: 0,
            food_carried: 0,
            stone_carried: 0,
            role: 0,
        };
        Some(pid)
    }

    /// Release a slot back to the free stack. The agent record, the kinship
    /// matrix, and the position index are left to the caller.
    fn kill(&mut self, pid: u16, alive_mask: &mut [bool]) {
        if !alive_mask[usize::from(pid)] {
            return;
        }
        alive_mask[usize::from(pid)] = false;
        self.free_pids.push(pid);
        self.alive.remove(usize::from(pid));
        self.alive_count -= 1;
    }

    /// Rebuild the cached alive list from the bitset. Must run before any
    /// pass that iterates alive slots.
    fn refresh_alive_list(&mut self) {
        self.alive.enumerate_into(&mut self.alive_pids);
        debug_assert_eq!(self.alive_pids.len(), self.alive_count);
    }
}

/// Number of gene positions where two slots carry the same allele.
#[must_use]
pub fn kinship_between(dnas: &[u8], a: usize, b: usize, n_genes: usize) -> u8 {
    let (a, b) = (a * n_genes, b * n_genes);
    let mut matches = 0;
    for g in 0..n_genes {
        if dnas[a + g] == dnas[b + g] {
            matches += 1;
        }
    }
    matches
}

/// Square symmetric kinship matrix plus the family-size vectors derived from
/// it. Rows are rewritten when a slot is born and deliberately left alone
/// when it dies, so a freshly terminated slot still reads its last-known
/// relations during the reward pass.
#[derive(Debug)]
struct KinshipLedger {
    matrix: Vec<u8>,
    family_sizes: Vec<u32>,
    prev_family_sizes: Vec<u32>,
    slots: usize,
    n_genes: usize,
}

impl KinshipLedger {
    fn new(slots: usize, n_genes: usize) -> Self {
        let mut ledger = Self {
            matrix: vec![0; slots * slots],
            family_sizes: vec![0; slots],
            prev_family_sizes: vec![0; slots],
            slots,
            n_genes,
        };
        ledger.reset();
        ledger
    }

    fn reset(&mut self) {
        self.matrix.fill(0);
        for i in 0..self.slots {
            self.matrix[i * self.slots + i] = self.n_genes as u8;
        }
        self.family_sizes.fill(0);
        self.prev_family_sizes.fill(0);
    }

    #[inline]
    fn get(&self, a: usize, b: usize) -> u8 {
        self.matrix[a * self.slots + b]
    }

    #[inline]
    fn set(&mut self, a: usize, b: usize, kinship: u8) {
        self.matrix[a * self.slots + b] = kinship;
    }

    /// Fill the row and column of a newborn slot against everything alive.
    /// The alive mask is authoritative here; the cached alive list may be
    /// stale mid-pass.
    fn record_birth(&mut self, pid: usize, dnas: &[u8], alive_mask: &[bool]) {
        let mut family = self.n_genes as u32; // itself
        for other in 0..self.slots {
            if other == pid || !alive_mask[other] {
                continue;
            }
            let kinship = kinship_between(dnas, pid, other, self.n_genes);
            self.set(pid, other, kinship);
            self.set(other, pid, kinship);
            family += u32::from(kinship);
        }
        self.prev_family_sizes[pid] = family;
    }

    fn commit_family_sizes(&mut self) {
        let Self {
            family_sizes,
            prev_family_sizes,
            ..
        } = self;
        prev_family_sizes.copy_from_slice(family_sizes);
    }
}

/// Counters tracked while `tick < min_ep_length`, folded into [`Log`] when
/// the episode ends.
#[derive(Debug, Clone, Copy, Default)]
struct EpisodeStats {
    births: u32,
    starvations: u32,
    murders: u32,
    stone_mined: u32,
    walls_built: u32,
    walls_destroyed: u32,
    food_stored: u32,
    food_eaten: u32,
    population_sum: u64,
    max_pop: usize,
    min_pop: usize,
    total_reward: f32,
    life_span_sum: u64,
    life_span_n: u32,
}

impl EpisodeStats {
    fn new() -> Self {
        Self {
            min_pop: usize::MAX,
            ..Self::default()
        }
    }
}

/// Cumulative per-episode aggregates, drained by the host through
/// [`Territories::take_log`]. Fields are running sums over `n` episodes
/// except `life_expectancy`, which holds the latest episode's mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Log {
    pub episode_length: f32,
    pub births: f32,
    pub starvations: f32,
    pub murders: f32,
    pub stone_mined: f32,
    pub walls_built: f32,
    pub walls_destroyed: f32,
    pub food_stored: f32,
    pub food_eaten: f32,
    pub max_pop: f32,
    pub min_pop: f32,
    pub avg_population: f32,
    pub total_reward: f32,
    pub life_expectancy: f32,
    pub genetic_diversity: f32,
    pub n: f32,
}

/// Summary of one finished episode, retained in a bounded history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeSummary {
    pub length: u32,
    pub births: u32,
    pub starvations: u32,
    pub murders: u32,
    pub final_population: usize,
    pub mean_population: f32,
    pub max_population: usize,
    pub min_population: usize,
    pub total_reward: f32,
    pub life_expectancy: f32,
    pub genetic_diversity: f32,
}

/// Clamp `value` into `[lo, hi]` and scale it onto a byte.
#[must_use]
pub fn quantize(value: f32, lo: f32, hi: f32) -> u8 {
    let v = value.clamp(lo, hi);
    ((v - lo) / (hi - lo) * 255.0).round() as u8
}

/// Ripe crop on a tile after `growth_days` days of growth.
#[must_use]
pub fn crop_available(growth_days: i32) -> i32 {
    ((GROWTH_K * f64::from(growth_days)).exp() - 1.0) as i32
}

/// The whole simulation: terrain, agent table, kinship ledger, and the
/// host-facing buffers, advanced one tick at a time.
pub struct Territories {
    config: TerritoriesConfig,
    rng: SmallRng,
    tick: u32,
    is_winter: bool,
    episode_budget: u32,
    grid: TileGrid,
    agents: Vec<Agent>,
    manager: AgentManager,
    kinship: KinshipLedger,
    dnas: Vec<u8>,
    observations: Vec<u8>,
    actions: Vec<i32>,
    rewards: Vec<f32>,
    terminals: Vec<bool>,
    truncations: Vec<bool>,
    alive_mask: Vec<bool>,
    obs_size: usize,
    stats: EpisodeStats,
    log: Log,
    history: VecDeque<EpisodeSummary>,
}

impl fmt::Debug for Territories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Territories")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("is_winter", &self.is_winter)
            .field("alive_count", &self.manager.alive_count)
            .finish()
    }
}

impl Territories {
    /// Validate the configuration, load the soil map, and allocate all
    /// fixed-capacity state. The world is empty until [`Self::reset`].
    pub fn new(config: TerritoriesConfig) -> Result<Self, WorldInitError> {
        config.validate()?;
        let is_soil = config.load_soil()?;
        let rng = config.seeded_rng();
        let vision_span = (2 * VISION_RADIUS + 1) as usize;
        let obs_size = vision_span * vision_span * (11 + config.n_genes) + 6 + config.n_genes + 5;
        let n = config.max_agents;
        Ok(Self {
            grid: TileGrid::new(config.width, config.height, is_soil),
            manager: AgentManager::new(n),
            kinship: KinshipLedger::new(n, config.n_genes),
            agents: vec![Agent::default(); n],
            dnas: vec![0; n * config.n_genes],
            observations: vec![0; n * obs_size],
            actions: vec![0; n],
            rewards: vec![0.0; n],
            terminals: vec![false; n],
            truncations: vec![false; n],
            alive_mask: vec![false; n],
            obs_size,
            tick: 0,
            is_winter: false,
            episode_budget: config.min_ep_length as u32,
            stats: EpisodeStats::new(),
            log: Log::default(),
            history: VecDeque::with_capacity(config.history_capacity),
            rng,
            config,
        })
    }

    /// Begin a fresh episode: clear the world, place stone deposits, seed the
    /// breeding pairs, and populate observations and rewards for tick 0.
    pub fn reset(&mut self) {
        self.truncations.fill(false);
        self.tick = 0;
        self.is_winter = false;
        let span = (self.config.max_ep_length - self.config.min_ep_length) as u32;
        self.episode_budget = self.config.min_ep_length as u32 + self.rng.random_range(0..span);
        self.grid.clear();
        self.manager.reset(&mut self.alive_mask);
        self.kinship.reset();

        // Stone deposits: four quarter-point anchors plus the centre.
        let (h, w) = (self.grid.height, self.grid.width);
        for ri in 0..2 {
            for ci in 0..2 {
                let r = ((0.25 + 0.50 * f64::from(ri)) * h as f64) as usize;
                let c = ((0.25 + 0.50 * f64::from(ci)) * w as f64) as usize;
                self.grid.tile_mut(r, c).stone = STONE_PER_MINE;
            }
        }
        self.grid.tile_mut(h / 2, w / 2).stone = STONE_PER_MINE;

        // Each breeding pair shares one random genome and starts adjacent.
        let n_genes = self.config.n_genes;
        for _ in 0..self.config.initial_pairs {
            let mut attempts = 0usize;
            loop {
                attempts += 1;
                if attempts > 16 * w * h {
                    break; // pathologically blocked map; seed fewer pairs
                }
                let adr = self.rng.random_range(0..w * h);
                let (r, c) = (adr / w, adr % w);
                if self.grid.is_blocked(r, c) {
                    continue;
                }
                let Some((r2, c2)) = self.find_empty_cell(r, c) else {
                    continue;
                };
                let mut dna = [0u8; MAX_GENES];
                for gene in dna.iter_mut().take(n_genes) {
                    *gene = self.rng.random_range(0..self.config.n_alleles) as u8;
                }
                self.spawn_agent(r, c, &dna[..n_genes]);
                self.spawn_agent(r2, c2, &dna[..n_genes]);
                break;
            }
        }
        self.manager.refresh_alive_list();

        // Rewards come first: the observation summary reads family sizes.
        self.compute_rewards();
        self.write_observations();
    }

    /// Advance exactly one tick. If an episode-end condition triggered at the
    /// top of the call, fold the episode into the log and reset instead,
    /// returning with the fresh episode's observations.
    pub fn step(&mut self) {
        self.terminals.fill(false);
        if self.manager.alive_count == 0 || self.tick >= self.episode_budget {
            self.finish_episode();
            self.reset();
            return;
        }

        // The season flips on the pre-advance clock; the action pass below
        // runs on the advanced one.
        let day = self.day_number();
        if !self.is_winter && day >= SUMMER_DURATION {
            self.is_winter = true;
        } else if self.is_winter && day < SUMMER_DURATION {
            self.is_winter = false;
            self.grid.restart_crops();
        }
        self.tick += 1;
        if self.stats_window() {
            self.stats.population_sum += self.manager.alive_count as u64;
            self.stats.max_pop = self.stats.max_pop.max(self.manager.alive_count);
            self.stats.min_pop = self.stats.min_pop.min(self.manager.alive_count);
        }

        self.manager.alive_pids.shuffle(&mut self.rng);
        let day = self.day_number();
        let acting = self.manager.alive_pids.len();
        for i in 0..acting {
            let pid = usize::from(self.manager.alive_pids[i]);
            self.act(pid, day);
        }
        self.manager.refresh_alive_list();
        self.death_sweep();
        self.manager.refresh_alive_list();

        if self.tick >= self.episode_budget {
            self.truncations.fill(true);
        }
        self.compute_rewards();
        self.write_observations();
    }

    /// Day of the year for the current tick.
    #[must_use]
    pub fn day_number(&self) -> u32 {
        (self.tick + STARTING_DAY) % YEAR_LENGTH
    }

    fn stats_window(&self) -> bool {
        (self.tick as usize) < self.config.min_ep_length
    }

    fn agent_cell(&self, pid: usize) -> (usize, usize) {
        let agent = &self.agents[pid];
        (usize::from(agent.r), usize::from(agent.c))
    }

    // Ageing, metabolism, and eating happen to each agent here, before its
    // action is resolved.
    fn act(&mut self, pid: usize, day: u32) {
        {
            let agent = &mut self.agents[pid];
            if agent.hp <= 0 {
                return; // struck down earlier in this pass
            }
            debug_assert!(agent.satiation > 0);
            agent.age += 1;
            if agent.age == REPRODUCTION_AGE {
                agent.hp_max = MAX_HP;
                agent.hp = MAX_HP;
            }
            agent.satiation -= METABOLISM_RATE;
        }
        self.auto_eat(pid);

        match Action::from_code(self.actions[pid]) {
            Action::MoveUp => self.act_move(pid, Direction::Up),
            Action::MoveRight => self.act_move(pid, Direction::Right),
            Action::MoveDown => self.act_move(pid, Direction::Down),
            Action::MoveLeft => self.act_move(pid, Direction::Left),
            Action::Noop => {}
            Action::Pickup => self.act_pickup(pid, day),
            Action::Mine => self.act_mine(pid),
            Action::Package => self.act_package(pid, day),
            Action::BuildWall => self.act_build_wall(pid),
            Action::Attack => self.act_attack(pid, day),
            Action::Reproduce => self.act_reproduce(pid),
        }

        if self.agents[pid].satiation <= 0 && self.stats_window() {
            self.stats.starvations += 1;
        }
    }

    fn auto_eat(&mut self, pid: usize) {
        let agent = &mut self.agents[pid];
        if agent.food_carried == 0 {
            return;
        }
        let appetite = (MAX_SATIATION - agent.satiation).max(0);
        let eaten = appetite.min(agent.food_carried);
        agent.food_carried -= eaten;
        agent.satiation += eaten;
        if (self.tick as usize) < self.config.min_ep_length {
            self.stats.food_eaten += eaten as u32;
        }
    }

    // A move in the facing direction steps forward; any other move only
    // turns. The position index is updated atomically with the coordinates.
    fn act_move(&mut self, pid: usize, direction: Direction) {
        if direction == self.agents[pid].dir {
            let (r, c) = self.agent_cell(pid);
            let (dr, dc) = direction.delta();
            let tr = wrap(r, dr, self.grid.height);
            let tc = wrap(c, dc, self.grid.width);
            if !self.grid.is_blocked(tr, tc) {
                self.grid.set_pid(r, c, None);
                self.grid.set_pid(tr, tc, Some(pid as u16));
                let agent = &mut self.agents[pid];
                agent.r = tr as u16;
                agent.c = tc as u16;
            }
        }
        self.agents[pid].dir = direction;
    }

    fn act_pickup(&mut self, pid: usize, day: u32) {
        let (r, c) = self.agent_cell(pid);
        let capacity = MAX_FOOD_CARRIED - self.agents[pid].food_carried;
        let stored = i32::from(self.grid.tile(r, c).stored_food);
        if stored > 0 {
            let taken = stored.min(capacity);
            self.grid.tile_mut(r, c).stored_food -= taken as u16;
            self.agents[pid].food_carried += taken;
            if taken == stored && !self.is_winter && self.grid.is_soil(r, c) {
                // emptied the cache, so the crop clock restarts
                self.grid.tile_mut(r, c).last_harvest = day as u16;
            }
            return;
        }
        let growth = self.grid.growth_days(self.is_winter, day, r, c);
        if growth <= 0 {
            return;
        }
        let crop = crop_available(growth);
        if crop == 0 {
            return; // nothing ripe yet, leave the clock running
        }
        self.grid.tile_mut(r, c).last_harvest = day as u16;
        let taken = crop.min(capacity);
        self.agents[pid].food_carried += taken;
        if taken < crop {
            // whatever the agent cannot carry stays on the tile
            self.grid.tile_mut(r, c).stored_food = (crop - taken) as u16;
        }
    }

    fn act_mine(&mut self, pid: usize) {
        if self.agents[pid].stone_carried >= MAX_STONE_CARRIED {
            return;
        }
        let (r, c) = self.agent_cell(pid);
        for dir in Direction::ALL {
            let (dr, dc) = dir.delta();
            let tr = wrap(r, dr, self.grid.height);
            let tc = wrap(c, dc, self.grid.width);
            if self.grid.tile(tr, tc).stone > 0 {
                self.grid.tile_mut(tr, tc).stone -= 1;
                let agent = &mut self.agents[pid];
                agent.dir = dir;
                agent.stone_carried += 1;
                if self.stats_window() {
                    self.stats.stone_mined += STONE_MINED_PER_TICK;
                }
                return;
            }
        }
    }

    // Harvest any ripe crop into the tile cache, then drop carried food on
    // top of it.
    fn act_package(&mut self, pid: usize, day: u32) {
        let (r, c) = self.agent_cell(pid);
        let growth = self.grid.growth_days(self.is_winter, day, r, c);
        if growth > 0 {
            let crop = crop_available(growth);
            if crop > 0 {
                let tile = self.grid.tile_mut(r, c);
                tile.last_harvest = day as u16;
                tile.stored_food += crop as u16;
                if self.stats_window() {
                    self.stats.food_stored += crop as u32;
                }
            }
        }
        if self.agents[pid].food_carried > 0 {
            let room = i32::from(MAX_FOOD_STORED) - i32::from(self.grid.tile(r, c).stored_food);
            let dropped = self.agents[pid].food_carried.min(room);
            if dropped > 0 {
                self.grid.tile_mut(r, c).stored_food += dropped as u16;
                self.agents[pid].food_carried -= dropped;
                if self.stats_window() {
                    self.stats.food_stored += dropped as u32;
                }
            }
        }
    }

    fn act_build_wall(&mut self, pid: usize) {
        if self.agents[pid].stone_carried == 0 {
            return;
        }
        let (r, c) = self.agent_cell(pid);
        let (dr, dc) = self.agents[pid].dir.delta();
        let tr = wrap(r, dr, self.grid.height);
        let tc = wrap(c, dc, self.grid.width);
        if !self.grid.is_blocked(tr, tc) {
            self.grid.place_wall(tr, tc);
            self.agents[pid].stone_carried -= 1;
            if self.stats_window() {
                self.stats.walls_built += 1;
            }
        }
    }

    // Sweep the sword arc of each facing, rotating clockwise from the
    // current one. The first occupied cell is the target and the attacker
    // turns toward it; a wall in the cell takes the hit before any agent.
    fn act_attack(&mut self, pid: usize, day: u32) {
        let (r, c) = self.agent_cell(pid);
        let facing = self.agents[pid].dir;
        for rotation in 0..4 {
            let dir = facing.rotated_clockwise(rotation);
            for (dr, dc) in dir.sword_arc() {
                let tr = wrap(r, dr, self.grid.height);
                let tc = wrap(c, dc, self.grid.width);
                if self.grid.tile(tr, tc).wall_hp > 0 {
                    self.agents[pid].dir = dir;
                    self.hit_wall(tr, tc, day);
                    return;
                }
                if let Some(target) = self.grid.pid_at(tr, tc) {
                    self.agents[pid].dir = dir;
                    self.hit_agent(pid, usize::from(target));
                    return;
                }
            }
        }
    }

    fn hit_wall(&mut self, r: usize, c: usize, day: u32) {
        let remaining = {
            let tile = self.grid.tile_mut(r, c);
            tile.wall_hp -= 1;
            tile.wall_hp
        };
        if remaining == 0 {
            if !self.is_winter && self.grid.is_soil(r, c) {
                // the crop can start to grow again once the wall falls
                self.grid.tile_mut(r, c).last_harvest = day as u16;
            }
            if self.stats_window() {
                self.stats.walls_destroyed += 1;
            }
        }
    }

    fn hit_agent(&mut self, attacker: usize, target: usize) {
        self.agents[target].hp -= 1;
        if self.agents[target].hp == 0 {
            if self.stats_window() {
                self.stats.murders += 1;
            }
            // Loot the victim. Its record stays on the grid until the death
            // sweep, so later attackers this pass may loot it again.
            let victim = self.agents[target];
            let agent = &mut self.agents[attacker];
            agent.satiation = (agent.satiation + victim.satiation / 2).min(MAX_SATIATION);
            agent.stone_carried = (agent.stone_carried + victim.stone_carried).min(MAX_STONE_CARRIED);
            agent.food_carried = (agent.food_carried + victim.food_carried).min(MAX_FOOD_CARRIED);
        }
    }

    fn act_reproduce(&mut self, pid: usize) {
        if !self.agents[pid].can_reproduce()
            || self.manager.alive_count >= self.config.max_agents
        {
            return;
        }
        let Some(mate) = self.find_mate(pid) else {
            return;
        };
        let (r, c) = self.agent_cell(pid);
        let Some((nr, nc)) = self.find_empty_cell(r, c) else {
            return; // no nursery cell; nobody pays
        };
        self.agents[pid].satiation -= MAX_SATIATION / 2;
        self.agents[usize::from(mate)].satiation -= MAX_SATIATION / 2;
        let Some(child) = self.manager.spawn(
            nr as u16,
            nc as u16,
            &mut self.agents,
            &mut self.alive_mask,
            &mut self.rng,
        ) else {
            return;
        };
        self.grid.set_pid(nr, nc, Some(child));

        let n_genes = self.config.n_genes;
        let child_base = usize::from(child) * n_genes;
        let own_base = pid * n_genes;
        let mate_base = usize::from(mate) * n_genes;
        for g in 0..n_genes {
            let from_self = self.rng.random_range(0..2u8) == 0;
            self.dnas[child_base + g] = if from_self {
                self.dnas[own_base + g]
            } else {
                self.dnas[mate_base + g]
            };
        }
        self.agents[usize::from(child)].role = self.rng.random_range(0..self.config.n_roles);
        // runs after the DNA is assigned
        self.kinship
            .record_birth(usize::from(child), &self.dnas, &self.alive_mask);
        if self.stats_window() {
            self.stats.births += 1;
        }
    }

    /// First Moore neighbour whose raw action this tick is `Reproduce` and
    /// who passes the fitness gate itself.
    fn find_mate(&self, pid: usize) -> Option<u16> {
        let (r, c) = self.agent_cell(pid);
        for dr in -1..=1 {
            for dc in -1..=1 {
                if dr == 0 && dc == 0 {
                    continue;
                }
                let tr = wrap(r, dr, self.grid.height);
                let tc = wrap(c, dc, self.grid.width);
                if let Some(mate) = self.grid.pid_at(tr, tc) {
                    if Action::from_code(self.actions[usize::from(mate)]) == Action::Reproduce
                        && self.agents[usize::from(mate)].can_reproduce()
                    {
                        return Some(mate);
                    }
                }
            }
        }
        None
    }

    fn find_empty_cell(&self, r: usize, c: usize) -> Option<(usize, usize)> {
        for dr in -1..=1 {
            for dc in -1..=1 {
                if dr == 0 && dc == 0 {
                    continue;
                }
                let tr = wrap(r, dr, self.grid.height);
                let tc = wrap(c, dc, self.grid.width);
                if !self.grid.is_blocked(tr, tc) {
                    return Some((tr, tc));
                }
            }
        }
        None
    }

    // Everyone who starved or ran out of hit points during the pass dies
    // here. Their kinship rows are left alone so the reward pass can still
    // attribute a final family value to them.
    fn death_sweep(&mut self) {
        let count = self.manager.alive_pids.len();
        for i in 0..count {
            let pid = self.manager.alive_pids[i];
            let agent = self.agents[usize::from(pid)];
            if agent.satiation <= 0 || agent.hp <= 0 {
                self.manager.kill(pid, &mut self.alive_mask);
                self.grid
                    .set_pid(usize::from(agent.r), usize::from(agent.c), None);
                self.terminals[usize::from(pid)] = true;
                self.stats.life_span_sum += u64::from(agent.age);
                self.stats.life_span_n += 1;
            }
        }
    }

    // Family sizes and rewards for every slot that is alive or terminated
    // this tick.
    fn compute_rewards(&mut self) {
        let n_genes = self.config.n_genes;
        for pid in 0..self.config.max_agents {
            if !self.alive_mask[pid] && !self.terminals[pid] {
                continue;
            }
            let mut family: u32 = 0;
            for &other in &self.manager.alive_pids {
                family += u32::from(self.kinship.get(pid, usize::from(other)));
            }
            self.kinship.family_sizes[pid] = family;
            let prev = self.kinship.prev_family_sizes[pid];
            let reward = if self.config.reward_growth_rate {
                if family == 0 {
                    debug_assert!(self.terminals[pid]);
                    let mut reward = self.config.extinction_reward;
                    if prev > 1 {
                        // a family collapsing from N straight to zero should
                        // not score better than dying out one at a time
                        reward += (1.0 / prev as f32).ln();
                    }
                    reward
                } else {
                    (family as f32 / prev as f32).ln()
                }
            } else {
                (family as f32 - prev as f32) / n_genes as f32
            };
            self.rewards[pid] = reward;
            if self.stats_window() {
                self.stats.total_reward += reward;
            }
        }
        self.kinship.commit_family_sizes();
    }

    // Byte tensor per alive agent: the vision field, the self block, and the
    // world summary. Dead slots keep their last observation.
    fn write_observations(&mut self) {
        let day = self.day_number();
        let n_genes = self.config.n_genes;
        let (h, w) = (self.grid.height, self.grid.width);
        for i in 0..self.manager.alive_pids.len() {
            let pid = usize::from(self.manager.alive_pids[i]);
            let agent = self.agents[pid];
            let mut adr = pid * self.obs_size;
            for dr in -VISION_RADIUS..=VISION_RADIUS {
                for dc in -VISION_RADIUS..=VISION_RADIUS {
                    let tr = wrap(usize::from(agent.r), dr, h);
                    let tc = wrap(usize::from(agent.c), dc, w);
                    let tile = *self.grid.tile(tr, tc);
                    self.observations[adr] = u8::from(self.grid.is_soil(tr, tc));
                    self.observations[adr + 1] =
                        self.grid.growth_days(self.is_winter, day, tr, tc).max(0) as u8;
                    self.observations[adr + 2] =
                        quantize(f32::from(tile.stored_food), 0.0, f32::from(MAX_FOOD_STORED));
                    self.observations[adr + 3] =
                        quantize(f32::from(tile.stone), 0.0, f32::from(STONE_PER_MINE));
                    self.observations[adr + 4] =
                        quantize(f32::from(tile.wall_hp), 0.0, f32::from(WALL_HP_MAX));
                    if let Some(other_pid) = self.grid.pid_at(tr, tc) {
                        let other_pid = usize::from(other_pid);
                        let other = self.agents[other_pid];
                        self.observations[adr + 5] = quantize(
                            f32::from(kinship_between(&self.dnas, pid, other_pid, n_genes)),
                            0.0,
                            1.0,
                        );
                        self.observations[adr + 6] = quantize(other.hp as f32, 0.0, MAX_HP as f32);
                        self.observations[adr + 7] = quantize(other.age as f32, 0.0, 100.0);
                        self.observations[adr + 8] =
                            quantize(other.satiation as f32, 0.0, MAX_SATIATION as f32);
                        // zero marks an empty cell, so these are offset by one
                        self.observations[adr + 9] = other.dir as u8 + 1;
                        self.observations[adr + 10] = (other.role + 1) as u8;
                        for g in 0..n_genes {
                            self.observations[adr + 11 + g] = self.dnas[other_pid * n_genes + g] + 1;
                        }
                    } else {
                        for byte in &mut self.observations[adr + 5..adr + 11 + n_genes] {
                            *byte = 0;
                        }
                    }
                    adr += 11 + n_genes;
                }
            }

            self.observations[adr] =
                quantize(agent.food_carried as f32, 0.0, MAX_FOOD_CARRIED as f32);
            self.observations[adr + 1] =
                quantize(agent.stone_carried as f32, 0.0, MAX_STONE_CARRIED as f32);
            self.observations[adr + 2] = quantize(agent.hp as f32, 0.0, MAX_HP as f32);
            self.observations[adr + 3] =
                quantize(agent.satiation as f32, 0.0, MAX_SATIATION as f32);
            self.observations[adr + 4] = quantize(agent.age as f32, 0.0, 100.0);
            self.observations[adr + 5] = agent.role as u8;
            for g in 0..n_genes {
                self.observations[adr + 6 + g] = self.dnas[pid * n_genes + g];
            }
            adr += 6 + n_genes;

            self.observations[adr] = quantize(f32::from(agent.r), 0.0, h as f32);
            self.observations[adr + 1] = quantize(f32::from(agent.c), 0.0, w as f32);
            self.observations[adr + 2] = quantize(day as f32, 0.0, YEAR_LENGTH as f32);
            self.observations[adr + 3] = quantize(
                self.kinship.family_sizes[pid] as f32,
                0.0,
                self.config.max_agents as f32,
            );
            self.observations[adr + 4] = quantize(
                self.manager.alive_count as f32,
                0.0,
                self.config.max_agents as f32,
            );
            debug_assert_eq!(adr + 5, (pid + 1) * self.obs_size);
        }
    }

    // Fold the episode's stats window into the cumulative log and the
    // bounded history.
    fn finish_episode(&mut self) {
        for &pid in &self.manager.alive_pids {
            self.stats.life_span_sum += u64::from(self.agents[usize::from(pid)].age);
            self.stats.life_span_n += 1;
        }
        let diversity = self.genetic_diversity();
        let stats = std::mem::replace(&mut self.stats, EpisodeStats::new());

        let tracked_ticks = self.tick.min(self.config.min_ep_length as u32).max(1);
        let mean_population = stats.population_sum as f32 / tracked_ticks as f32;
        let min_pop = if stats.min_pop == usize::MAX {
            0
        } else {
            stats.min_pop
        };
        let life_expectancy = if stats.life_span_n > 0 {
            stats.life_span_sum as f32 / stats.life_span_n as f32
        } else {
            0.0
        };

        self.log.episode_length += self.tick as f32;
        self.log.births += stats.births as f32;
        self.log.starvations += stats.starvations as f32;
        self.log.murders += stats.murders as f32;
        self.log.stone_mined += stats.stone_mined as f32;
        self.log.walls_built += stats.walls_built as f32;
        self.log.walls_destroyed += stats.walls_destroyed as f32;
        self.log.food_stored += stats.food_stored as f32;
        self.log.food_eaten += stats.food_eaten as f32;
        self.log.max_pop += stats.max_pop as f32;
        self.log.min_pop += min_pop as f32;
        self.log.avg_population += mean_population;
        self.log.total_reward += stats.total_reward;
        self.log.life_expectancy = life_expectancy;
        self.log.genetic_diversity += diversity;
        self.log.n += 1.0;

        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(EpisodeSummary {
            length: self.tick,
            births: stats.births,
            starvations: stats.starvations,
            murders: stats.murders,
            final_population: self.manager.alive_count,
            mean_population,
            max_population: stats.max_pop,
            min_population: min_pop,
            total_reward: stats.total_reward,
            life_expectancy,
            genetic_diversity: diversity,
        });
    }

    /// Summed allele entropy over genes for the alive population.
    #[must_use]
    pub fn genetic_diversity(&self) -> f32 {
        let alive = self.manager.alive_count;
        if alive == 0 {
            return 0.0;
        }
        let n_genes = self.config.n_genes;
        let n_alleles = usize::from(self.config.n_alleles);
        let mut allele_counts = vec![0u32; n_genes * n_alleles];
        for &pid in &self.manager.alive_pids {
            for g in 0..n_genes {
                let allele = self.dnas[usize::from(pid) * n_genes + g];
                allele_counts[g * n_alleles + usize::from(allele)] += 1;
            }
        }
        let mut diversity = 0.0f32;
        for &count in &allele_counts {
            if count == 0 {
                continue;
            }
            let p = count as f32 / alive as f32;
            diversity -= p * p.log2();
        }
        diversity
    }

    /// Spawn an agent with the given genome at an unblocked cell, wiring up
    /// the position index and the kinship ledger. `None` when the cell is
    /// blocked or the table is full.
    pub fn spawn_agent(&mut self, r: usize, c: usize, dna: &[u8]) -> Option<u16> {
        debug_assert_eq!(dna.len(), self.config.n_genes);
        if self.grid.is_blocked(r, c) {
            return None;
        }
        let pid = self.manager.spawn(
            r as u16,
            c as u16,
            &mut self.agents,
            &mut self.alive_mask,
            &mut self.rng,
        )?;
        self.grid.set_pid(r, c, Some(pid));
        let base = usize::from(pid) * self.config.n_genes;
        self.dnas[base..base + self.config.n_genes].copy_from_slice(dna);
        self.kinship
            .record_birth(usize::from(pid), &self.dnas, &self.alive_mask);
        self.manager.refresh_alive_list();
        Some(pid)
    }

    /// Raise a wall on an unblocked cell, wiping its resources. Returns
    /// whether a wall was placed.
    pub fn place_wall(&mut self, r: usize, c: usize) -> bool {
        if self.grid.is_blocked(r, c) {
            return false;
        }
        self.grid.place_wall(r, c);
        true
    }

    /// Tear a wall down; on summer soil the crop clock restarts immediately.
    pub fn destroy_wall(&mut self, r: usize, c: usize) {
        if self.grid.tile(r, c).wall_hp == 0 {
            return;
        }
        self.grid.tile_mut(r, c).wall_hp = 0;
        if !self.is_winter && self.grid.is_soil(r, c) {
            let day = self.day_number();
            self.grid.tile_mut(r, c).last_harvest = day as u16;
        }
    }

    /// Days of accumulated crop growth on `(r, c)` under the current clock.
    #[must_use]
    pub fn growth_days(&self, r: usize, c: usize) -> i32 {
        self.grid
            .growth_days(self.is_winter, self.day_number(), r, c)
    }

    /// Immutable access to configuration.
    #[must_use]
    pub fn config(&self) -> &TerritoriesConfig {
        &self.config
    }

    /// Current tick within the episode.
    #[must_use]
    pub const fn tick(&self) -> u32 {
        self.tick
    }

    /// Whether the world is in its winter days.
    #[must_use]
    pub const fn is_winter(&self) -> bool {
        self.is_winter
    }

    /// Number of alive agents.
    #[must_use]
    pub const fn alive_count(&self) -> usize {
        self.manager.alive_count
    }

    /// The cached alive list, in this tick's processing order.
    #[must_use]
    pub fn alive_pids(&self) -> &[u16] {
        &self.manager.alive_pids
    }

    /// Bytes per agent observation.
    #[must_use]
    pub const fn obs_size(&self) -> usize {
        self.obs_size
    }

    /// The full observation buffer, `max_agents * obs_size` bytes.
    #[must_use]
    pub fn observations(&self) -> &[u8] {
        &self.observations
    }

    /// Observation slice for one slot.
    #[must_use]
    pub fn observation(&self, pid: u16) -> &[u8] {
        let base = usize::from(pid) * self.obs_size;
        &self.observations[base..base + self.obs_size]
    }

    /// The action buffer the host writes one code per slot into.
    pub fn actions_mut(&mut self) -> &mut [i32] {
        &mut self.actions
    }

    /// Rewards written by the last step, one per slot.
    #[must_use]
    pub fn rewards(&self) -> &[f32] {
        &self.rewards
    }

    /// Slots terminated during the last step.
    #[must_use]
    pub fn terminals(&self) -> &[bool] {
        &self.terminals
    }

    /// Set on every slot when the episode budget is reached.
    #[must_use]
    pub fn truncations(&self) -> &[bool] {
        &self.truncations
    }

    /// Alive flags, one per slot.
    #[must_use]
    pub fn alive_mask(&self) -> &[bool] {
        &self.alive_mask
    }

    /// The full DNA buffer, `max_agents * n_genes` bytes.
    #[must_use]
    pub fn dnas(&self) -> &[u8] {
        &self.dnas
    }

    /// The full kinship matrix, `max_agents * max_agents` bytes, row major.
    #[must_use]
    pub fn kinship_matrix(&self) -> &[u8] {
        &self.kinship.matrix
    }

    /// Kinship between two slots as recorded in the matrix.
    #[must_use]
    pub fn kinship(&self, a: u16, b: u16) -> u8 {
        self.kinship.get(usize::from(a), usize::from(b))
    }

    /// Family size of a slot as of the last reward pass.
    #[must_use]
    pub fn family_size(&self, pid: u16) -> u32 {
        self.kinship.family_sizes[usize::from(pid)]
    }

    /// Agent record for an alive slot.
    #[must_use]
    pub fn agent(&self, pid: u16) -> Option<&Agent> {
        self.alive_mask[usize::from(pid)].then(|| &self.agents[usize::from(pid)])
    }

    /// Mutable agent record for an alive slot.
    pub fn agent_mut(&mut self, pid: u16) -> Option<&mut Agent> {
        if self.alive_mask[usize::from(pid)] {
            Some(&mut self.agents[usize::from(pid)])
        } else {
            None
        }
    }

    /// Terrain state of one cell.
    #[must_use]
    pub fn tile(&self, r: usize, c: usize) -> &Tile {
        self.grid.tile(r, c)
    }

    /// Mutable terrain state of one cell.
    pub fn tile_mut(&mut self, r: usize, c: usize) -> &mut Tile {
        self.grid.tile_mut(r, c)
    }

    /// Whether a cell is soil.
    #[must_use]
    pub fn is_soil(&self, r: usize, c: usize) -> bool {
        self.grid.is_soil(r, c)
    }

    /// The agent standing on a cell, if any.
    #[must_use]
    pub fn pid_at(&self, r: usize, c: usize) -> Option<u16> {
        self.grid.pid_at(r, c)
    }

    /// Iterate over retained episode summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &EpisodeSummary> {
        self.history.iter()
    }

    /// Cumulative episode log so far.
    #[must_use]
    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Drain the cumulative episode log.
    pub fn take_log(&mut self) -> Log {
        std::mem::take(&mut self.log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> TerritoriesConfig {
        TerritoriesConfig {
            width: 8,
            height: 8,
            max_agents: 16,
            n_genes: 1,
            n_alleles: 2,
            initial_pairs: 0,
            min_ep_length: 64,
            max_ep_length: 65,
            rng_seed: Some(7),
            ..TerritoriesConfig::default()
        }
    }

    fn fresh_world(config: TerritoriesConfig) -> Territories {
        let mut world = Territories::new(config).expect("world");
        world.reset();
        world.actions_mut().fill(Action::Noop as i32);
        world
    }

    #[test]
    fn action_codes_decode_with_noop_fallback() {
        assert_eq!(Action::from_code(0), Action::MoveUp);
        assert_eq!(Action::from_code(2), Action::MoveDown);
        assert_eq!(Action::from_code(10), Action::Reproduce);
        assert_eq!(Action::from_code(4), Action::Noop);
        assert_eq!(Action::from_code(11), Action::Noop);
        assert_eq!(Action::from_code(-3), Action::Noop);
    }

    #[test]
    fn wrap_is_toroidal_on_both_edges() {
        assert_eq!(wrap(0, -1, 8), 7);
        assert_eq!(wrap(7, 1, 8), 0);
        assert_eq!(wrap(3, 0, 8), 3);
        assert_eq!(wrap(1, -4, 8), 5);
    }

    #[test]
    fn crop_curve_boundaries() {
        assert_eq!(crop_available(0), 0);
        assert_eq!(crop_available(1), 0);
        assert_eq!(crop_available(MAX_GROWTH_DURATION), 150);
    }

    #[test]
    fn quantize_rounds_and_clamps() {
        assert_eq!(quantize(0.0, 0.0, 8.0), 0);
        assert_eq!(quantize(8.0, 0.0, 8.0), 255);
        assert_eq!(quantize(4.0, 0.0, 8.0), 128);
        assert_eq!(quantize(200.0, 0.0, 150.0), 255);
        assert_eq!(quantize(-5.0, 0.0, 150.0), 0);
    }

    #[test]
    fn config_validation_rejects_bad_options() {
        let cases = [
            TerritoriesConfig {
                n_genes: 4,
                ..base_config()
            },
            TerritoriesConfig {
                n_alleles: 0,
                ..base_config()
            },
            TerritoriesConfig {
                width: 0,
                ..base_config()
            },
            TerritoriesConfig {
                max_agents: 0,
                ..base_config()
            },
            TerritoriesConfig {
                n_roles: 0,
                ..base_config()
            },
            TerritoriesConfig {
                min_ep_length: 64,
                max_ep_length: 64,
                ..base_config()
            },
            TerritoriesConfig {
                extinction_reward: 0.5,
                ..base_config()
            },
            TerritoriesConfig {
                initial_pairs: 9,
                ..base_config()
            },
            TerritoriesConfig {
                history_capacity: 0,
                ..base_config()
            },
        ];
        for config in cases {
            assert!(matches!(
                Territories::new(config),
                Err(WorldInitError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn bitmap_length_must_match_grid() {
        let config = TerritoriesConfig {
            map: MapSource::Bitmap(vec![true; 10]),
            ..base_config()
        };
        assert!(matches!(
            Territories::new(config),
            Err(WorldInitError::MapSize {
                expected: 64,
                actual: 10
            })
        ));
    }

    #[test]
    fn pickup_from_growth_spills_excess_to_the_tile() {
        let mut world = fresh_world(base_config());
        let pid = world.spawn_agent(0, 0, &[0]).expect("spawn");
        world.agent_mut(pid).expect("agent").food_carried = 120;
        world.actions_mut()[usize::from(pid)] = Action::Pickup as i32;

        world.step();

        // day 56: eats 5 on the way in, then fills up from 56 days of growth
        let agent = world.agent(pid).expect("agent");
        assert_eq!(agent.satiation, 100);
        assert_eq!(agent.food_carried, MAX_FOOD_CARRIED);
        let tile = world.tile(0, 0);
        assert_eq!(tile.stored_food, 19);
        assert_eq!(tile.last_harvest, 56);
        assert_eq!(world.growth_days(0, 0), 0); // cached food stalls the clock
    }

    #[test]
    fn pickup_empties_store_and_restarts_clock() {
        let mut world = fresh_world(base_config());
        let pid = world.spawn_agent(0, 0, &[0]).expect("spawn");
        world.tile_mut(0, 0).stored_food = 20;
        world.actions_mut()[usize::from(pid)] = Action::Pickup as i32;

        world.step();

        let agent = world.agent(pid).expect("agent");
        assert_eq!(agent.food_carried, 20);
        assert_eq!(world.tile(0, 0).stored_food, 0);
        assert_eq!(world.tile(0, 0).last_harvest, 56);

        world.actions_mut()[usize::from(pid)] = Action::Noop as i32;
        world.step();
        let agent = world.agent(pid).expect("agent");
        assert_eq!(agent.satiation, MAX_SATIATION);
        assert_eq!(agent.food_carried, 10);
    }

    #[test]
    fn package_caches_crop_then_carried_food() {
        let mut world = fresh_world(base_config());
        let pid = world.spawn_agent(0, 1, &[0]).expect("spawn");
        world.agent_mut(pid).expect("agent").food_carried = 30;
        world.actions_mut()[usize::from(pid)] = Action::Package as i32;

        world.step();

        let agent = world.agent(pid).expect("agent");
        assert_eq!(agent.food_carried, 0);
        let tile = world.tile(0, 1);
        assert_eq!(tile.stored_food, 54 + 25); // 56-day crop plus what was left after eating
        assert_eq!(tile.last_harvest, 56);
    }

    #[test]
    fn mine_turns_toward_deposit_and_respects_the_cap() {
        let mut world = fresh_world(base_config());
        // reset placed a deposit at (2, 2)
        assert_eq!(world.tile(2, 2).stone, STONE_PER_MINE);
        let pid = world.spawn_agent(2, 3, &[0]).expect("spawn");
        world.actions_mut()[usize::from(pid)] = Action::Mine as i32;

        world.step();
        let agent = world.agent(pid).expect("agent");
        assert_eq!(agent.stone_carried, 1);
        assert_eq!(agent.dir, Direction::Left);
        assert_eq!(world.tile(2, 2).stone, STONE_PER_MINE - 1);

        world.agent_mut(pid).expect("agent").stone_carried = MAX_STONE_CARRIED;
        world.step();
        assert_eq!(world.tile(2, 2).stone, STONE_PER_MINE - 1);
    }

    #[test]
    fn attack_on_an_empty_arc_is_a_noop() {
        let mut world = fresh_world(base_config());
        let pid = world.spawn_agent(0, 0, &[0]).expect("spawn");
        world.actions_mut()[usize::from(pid)] = Action::Attack as i32;

        world.step();

        let agent = world.agent(pid).expect("agent");
        assert_eq!((agent.r, agent.c), (0, 0));
        assert_eq!(agent.satiation, MAX_SATIATION - METABOLISM_RATE);
        assert_eq!(world.alive_count(), 1);
    }

    #[test]
    fn winter_flips_and_summer_restarts_growth() {
        let mut world = fresh_world(base_config());
        let pid = world.spawn_agent(0, 0, &[0]).expect("spawn");
        for step in 1..=56 {
            world.agent_mut(pid).expect("agent").food_carried = 150;
            world.step();
            match step {
                45 => assert!(!world.is_winter()),
                46 => assert!(world.is_winter()),
                55 => assert!(world.is_winter()),
                _ => {}
            }
        }
        assert!(!world.is_winter());
        assert_eq!(world.growth_days(0, 1), 1);
    }

    #[test]
    fn wall_roundtrip_restores_a_grass_tile() {
        let config = TerritoriesConfig {
            map: MapSource::Bitmap(vec![false; 64]),
            ..base_config()
        };
        let mut world = fresh_world(config);
        assert!(world.place_wall(0, 0));
        assert_eq!(
            *world.tile(0, 0),
            Tile {
                wall_hp: WALL_HP_MAX,
                ..Tile::default()
            }
        );
        world.destroy_wall(0, 0);
        assert_eq!(*world.tile(0, 0), Tile::default());

        // a stone deposit blocks placement
        assert!(!world.place_wall(2, 2));
        assert_eq!(world.tile(2, 2).stone, STONE_PER_MINE);
    }

    #[test]
    fn killed_slots_are_recycled_from_the_free_stack() {
        let mut world = fresh_world(base_config());
        let first = world.spawn_agent(0, 0, &[0]).expect("spawn");
        let second = world.spawn_agent(0, 3, &[1]).expect("spawn");
        assert_eq!((first, second), (0, 1));

        world.agent_mut(second).expect("agent").satiation = 1;
        world.step();
        assert!(world.terminals()[usize::from(second)]);
        assert_eq!(world.alive_count(), 1);
        assert!(world.pid_at(0, 3).is_none());

        let third = world.spawn_agent(0, 5, &[1]).expect("spawn");
        assert_eq!(third, second);
        assert_eq!(world.alive_count(), 2);
        assert_eq!(world.manager.alive.len(), world.manager.alive_count);
        assert_eq!(world.alive_pids(), &[0, 1]);
    }
}
