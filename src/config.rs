use crate::error::{Result, SimError};

pub type BaseType = usize;

pub type Lba = BaseType;
pub type PageId = BaseType;
pub type BlockId = BaseType;
pub type Counter = BaseType;

/// Simulated time, in microseconds.
pub type Time = f64;

pub const PAGE_SIZE: BaseType = 4096;

/// Physical layout of the simulated drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub packages: BaseType,
    pub dies_per_package: BaseType,
    pub planes_per_die: BaseType,
    pub blocks_per_plane: BaseType,
    pub pages_per_block: BaseType,
    pub page_size: BaseType,
}

impl Geometry {
    pub fn total_dies(&self) -> BaseType {
        self.packages * self.dies_per_package
    }

    pub fn blocks_per_die(&self) -> BaseType {
        self.planes_per_die * self.blocks_per_plane
    }

    pub fn total_blocks(&self) -> BaseType {
        self.total_dies() * self.blocks_per_die()
    }

    pub fn total_pages(&self) -> BaseType {
        self.total_blocks() * self.pages_per_block
    }

    pub fn capacity_bytes(&self) -> BaseType {
        self.total_pages() * self.page_size
    }

    /// Flat index of a (package, die) pair.
    pub fn die_index(&self, package: BaseType, die: BaseType) -> BaseType {
        package * self.dies_per_package + die
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            packages: 2,
            dies_per_package: 2,
            planes_per_die: 1,
            blocks_per_plane: 64,
            pages_per_block: 64,
            page_size: PAGE_SIZE,
        }
    }
}

/// Where new writes are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockManagerPolicy {
    RoundRobin,
    ShortestQueue,
    HotCold,
    Tagged,
}

/// How garbage-collection victims are picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPolicy {
    Greedy,
    Lru,
}

/// Order in which a runnable batch is handed to the flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingScheme {
    Fifo,
    ReadEraseWrite,
    InternalFirst,
    ApplicationFirst,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub geometry: Geometry,

    pub page_read_delay: Time,
    pub page_write_delay: Time,
    pub bus_ctrl_delay: Time,
    pub bus_data_delay: Time,
    pub block_erase_delay: Time,

    /// Free blocks a die should keep before garbage collection kicks in.
    pub greed_scale: Counter,
    /// Fraction of raw pages hidden from the logical address space.
    pub over_provisioning_factor: f64,

    pub block_manager: BlockManagerPolicy,
    pub gc_policy: GcPolicy,
    pub scheduling_scheme: SchedulingScheme,

    pub num_age_classes: Counter,
    pub allow_deferring_transfers: bool,
    pub enable_copy_back: bool,
    /// Per victim block, 0 means unlimited.
    pub max_concurrent_migrations: Counter,
    /// Writes to one logical page before it counts as hot.
    pub hot_write_threshold: Counter,
    /// Erase-count spread that triggers wear leveling, 0 disables it.
    pub wear_leveling_threshold: Counter,

    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            geometry: Geometry::default(),
            page_read_delay: 115.0,
            page_write_delay: 1600.0,
            bus_ctrl_delay: 5.0,
            bus_data_delay: 100.0,
            block_erase_delay: 3000.0,
            greed_scale: 2,
            over_provisioning_factor: 0.07,
            block_manager: BlockManagerPolicy::RoundRobin,
            gc_policy: GcPolicy::Greedy,
            scheduling_scheme: SchedulingScheme::Fifo,
            num_age_classes: 1,
            allow_deferring_transfers: false,
            enable_copy_back: false,
            max_concurrent_migrations: 4,
            hot_write_threshold: 4,
            wear_leveling_threshold: 0,
            seed: 7,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let g = &self.geometry;
        if g.packages == 0
            || g.dies_per_package == 0
            || g.planes_per_die == 0
            || g.blocks_per_plane == 0
            || g.pages_per_block == 0
            || g.page_size == 0
        {
            return Err(SimError::InvalidConfig(format!("geometry has an empty level: {g:?}")));
        }
        if !(0.0..1.0).contains(&self.over_provisioning_factor) {
            return Err(SimError::InvalidConfig(format!(
                "over provisioning factor {} outside [0, 1)",
                self.over_provisioning_factor
            )));
        }
        if self.num_age_classes == 0 {
            return Err(SimError::InvalidConfig("at least one age class is required".into()));
        }
        let delays = [
            self.page_read_delay,
            self.page_write_delay,
            self.bus_ctrl_delay,
            self.bus_data_delay,
            self.block_erase_delay,
        ];
        if delays.iter().any(|d| !(*d > 0.0)) {
            return Err(SimError::InvalidConfig(format!("timing constants must be positive: {delays:?}")));
        }
        Ok(())
    }

    /// Pages exposed to the host once over-provisioning is taken out.
    pub fn logical_size(&self) -> Lba {
        let all_pages = self.geometry.total_pages();
        let op_pages = (all_pages as f64 * self.over_provisioning_factor).trunc() as Lba;
        all_pages - op_pages
    }

    /// Free pages application writes may never take: one block per die,
    /// kept below the over-provisioned pages so a fully written logical
    /// space can still be overwritten.
    pub fn gc_reserve_pages(&self) -> Counter {
        let geo = &self.geometry;
        let op_pages = geo.total_pages() - self.logical_size();
        op_pages.saturating_sub(1).min(geo.pages_per_block * geo.total_dies())
    }
}
