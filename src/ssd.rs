use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use crate::address::Address;
use crate::block_manager::BlockManager;
use crate::config::{Config, Counter, Lba, Time};
use crate::error::{Result, SimError};
use crate::event::{Event, EventType};
use crate::flash::Flash;
use crate::ftl::{Ftl, PageFtl};
use crate::gc::GarbageCollector;
use crate::operation::OpId;
use crate::scheduler::IoScheduler;

/// Totals over every event finished so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub reads: Counter,
    pub writes: Counter,
    pub trims: Counter,
    pub erases: Counter,
    pub migrations: Counter,
    pub noops: Counter,
    pub redundant_gc_migrations: Counter,
    pub application_ios: Counter,
    pub total_application_latency: Time,
}

impl Stats {
    fn record(&mut self, event: &Event) {
        if event.noop {
            self.noops += 1;
            return;
        }
        match event.event_type {
            EventType::ReadTransfer => self.reads += 1,
            EventType::Write | EventType::CopyBack => self.writes += 1,
            EventType::Trim => self.trims += 1,
            EventType::Erase => self.erases += 1,
            _ => return,
        }
        if event.original_application_io {
            self.application_ios += 1;
            self.total_application_latency += event.latency();
        }
    }

    pub fn average_application_latency(&self) -> Time {
        if self.application_ios == 0 {
            return 0.0;
        }
        self.total_application_latency / self.application_ios as Time
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reads, {} writes, {} trims, {} erases, {} migrations ({} redundant), {} noops, avg latency {:.1}us",
            self.reads,
            self.writes,
            self.trims,
            self.erases,
            self.migrations,
            self.redundant_gc_migrations,
            self.noops,
            self.average_application_latency()
        )
    }
}

/// A simulated drive: a page-mapped FTL in front of the I/O scheduler.
pub struct Ssd {
    config: Arc<Config>,
    scheduler: IoScheduler,
    stats: Stats,
    history: Option<Vec<Event>>,
}

impl Ssd {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let ftl = PageFtl::new(Arc::clone(&config));
        Ok(Self::with_ftl(config, Box::new(ftl)))
    }

    pub fn with_ftl(config: Arc<Config>, ftl: Box<dyn Ftl>) -> Self {
        info!(
            "{} dies, {} blocks, {} logical pages",
            config.geometry.total_dies(),
            config.geometry.total_blocks(),
            ftl.logical_size()
        );
        Ssd {
            scheduler: IoScheduler::new(Arc::clone(&config), ftl),
            stats: Stats::default(),
            history: None,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logical_size(&self) -> Lba {
        self.scheduler.ftl().logical_size()
    }

    fn check_range(&self, lba: Lba) -> Result<()> {
        let logical_size = self.logical_size();
        if lba >= logical_size {
            return Err(SimError::LogicalAddressOutOfRange { address: lba, logical_size });
        }
        Ok(())
    }

    pub fn write(&mut self, lba: Lba, time: Time) -> Result<()> {
        self.check_range(lba)?;
        let chain = self.scheduler.ftl_mut().write(lba, time);
        self.submit(chain);
        Ok(())
    }

    pub fn read(&mut self, lba: Lba, time: Time) -> Result<()> {
        self.check_range(lba)?;
        let chain = self.scheduler.ftl_mut().read(lba, time);
        self.submit(chain);
        Ok(())
    }

    pub fn trim(&mut self, lba: Lba, time: Time) -> Result<()> {
        self.check_range(lba)?;
        let chain = self.scheduler.ftl_mut().trim(lba, time);
        self.submit(chain);
        Ok(())
    }

    /// Read that may be served from any of `candidates`, falling back to the
    /// mapping when none of them holds valid data.
    pub fn read_flexible(&mut self, lba: Lba, candidates: Vec<Address>, time: Time) -> Result<()> {
        self.check_range(lba)?;
        self.submit(VecDeque::from([Event::flexible_read(lba, candidates, time)]));
        Ok(())
    }

    /// Schedules a chain of dependent events as one operation.
    pub fn submit(&mut self, chain: VecDeque<Event>) -> Option<OpId> {
        self.scheduler.schedule_events_queue(chain)
    }

    pub fn schedule_gc(&mut self, time: Time, package: Option<usize>, die: Option<usize>) {
        self.scheduler.schedule_gc(time, package, die);
    }

    /// Keeps a copy of every finished event from now on.
    pub fn record_history(&mut self) {
        self.history.get_or_insert_with(Vec::new);
    }

    pub fn history(&self) -> &[Event] {
        self.history.as_deref().unwrap_or_default()
    }

    /// Runs until nothing is left to do.
    pub fn run(&mut self) -> Result<Stats> {
        while !self.scheduler.is_empty() {
            self.scheduler.execute_soonest_events()?;
            for event in self.scheduler.take_completed() {
                self.stats.record(&event);
                if let Some(history) = self.history.as_mut() {
                    history.push(event);
                }
            }
        }
        self.stats.migrations = self.scheduler.migrator().migrations();
        self.stats.redundant_gc_migrations = self.scheduler.block_manager().redundant_gc_migrations();
        debug!("idle at {:.1}: {}", self.scheduler.now(), self.stats);
        Ok(self.stats.clone())
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn scheduler(&self) -> &IoScheduler {
        &self.scheduler
    }

    pub fn block_manager(&self) -> &BlockManager {
        self.scheduler.block_manager()
    }

    pub fn garbage_collector(&self) -> &GarbageCollector {
        self.scheduler.migrator().garbage_collector()
    }

    pub fn flash(&self) -> &Flash {
        self.scheduler.flash()
    }

    pub fn ftl(&self) -> &dyn Ftl {
        self.scheduler.ftl()
    }

    /// Physical page currently holding `lba`, invalid when unmapped.
    pub fn lookup(&self, lba: Lba) -> Address {
        let mut probe = Event::application(EventType::Read, lba, 0.0);
        self.ftl().set_read_address(&mut probe);
        probe.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlockManagerPolicy, Geometry, SchedulingScheme, PAGE_SIZE};
    use crate::flash::PageState;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn config(dies: usize, blocks: usize, pages: usize, over_provisioning: f64) -> Config {
        Config {
            geometry: Geometry {
                packages: 1,
                dies_per_package: dies,
                planes_per_die: 1,
                blocks_per_plane: blocks,
                pages_per_block: pages,
                page_size: PAGE_SIZE,
            },
            over_provisioning_factor: over_provisioning,
            ..Config::default()
        }
    }

    /// Every mapped page is valid on flash and nothing else is.
    fn assert_consistent(ssd: &Ssd) {
        let bm = ssd.block_manager();
        assert_eq!(bm.num_free_pages(), bm.free_pages_in_structures());
        assert!(bm.num_available_pages_for_new_writes() <= bm.num_free_pages());
        assert_eq!(bm.reserved_for_gc(), 0);

        let mut mapped = 0;
        for lba in 0..ssd.logical_size() {
            let address = ssd.lookup(lba);
            if address.is_valid() {
                assert_eq!(ssd.flash().page_state(&address), PageState::Valid, "lba {lba} at {address}");
                assert_eq!(ssd.ftl().get_logical_address(&address), Some(lba));
                mapped += 1;
            }
        }
        let valid: Counter = ssd.flash().blocks().map(|block| block.pages_valid()).sum();
        assert_eq!(valid, mapped);
    }

    #[test]
    fn sequential_fill_uses_every_page() {
        let mut ssd = Ssd::new(config(1, 4, 4, 0.0)).unwrap();
        for lba in 0..16 {
            ssd.write(lba, lba as Time * 2000.0).unwrap();
        }
        let stats = ssd.run().unwrap();

        assert_eq!(stats.writes, 16);
        assert_eq!(stats.erases, 0);
        assert_eq!(ssd.block_manager().num_free_pages(), 0);
        assert_consistent(&ssd);
    }

    #[test]
    fn rejects_addresses_past_logical_size() {
        let mut ssd = Ssd::new(config(1, 4, 4, 0.25)).unwrap();
        assert_eq!(ssd.logical_size(), 12);
        assert!(matches!(
            ssd.write(12, 0.0),
            Err(SimError::LogicalAddressOutOfRange { address: 12, logical_size: 12 })
        ));
        assert!(ssd.read(11, 0.0).is_ok());
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(matches!(Ssd::new(config(0, 4, 4, 0.0)), Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn overwrites_reclaim_blocks() {
        let mut ssd = Ssd::new(config(1, 4, 4, 0.25)).unwrap();
        ssd.record_history();
        let mut saw_candidate = false;
        for i in 0..20 {
            ssd.write(i % 2, i as Time * 5000.0).unwrap();
            ssd.run().unwrap();
            saw_candidate |= (0..4).any(|block| ssd.garbage_collector().is_candidate(block));
        }
        let stats = ssd.stats().clone();

        assert!(saw_candidate);
        assert_eq!(stats.writes, 20);
        assert!(stats.erases >= 1);
        assert!(ssd.history().iter().any(|e| e.event_type == EventType::Erase && e.garbage_collection_op));
        assert_consistent(&ssd);
    }

    #[test]
    fn read_sees_preceding_write() {
        let mut ssd = Ssd::new(config(1, 4, 4, 0.0)).unwrap();
        ssd.record_history();
        ssd.write(3, 0.0).unwrap();
        ssd.read(3, 0.5).unwrap();
        let stats = ssd.run().unwrap();

        assert_eq!((stats.reads, stats.writes), (1, 1));
        assert!(stats.average_application_latency() > 0.0);
        let transfer = ssd.history().iter().find(|e| e.event_type == EventType::ReadTransfer).unwrap();
        assert_eq!(transfer.address, ssd.lookup(3));
    }

    #[test]
    fn trim_cancels_pending_write() {
        let mut ssd = Ssd::new(config(1, 4, 4, 0.0)).unwrap();
        ssd.write(2, 0.0).unwrap();
        ssd.trim(2, 0.5).unwrap();
        let stats = ssd.run().unwrap();

        assert_eq!((stats.writes, stats.trims, stats.noops), (0, 1, 1));
        assert!(!ssd.lookup(2).is_valid());
        assert_consistent(&ssd);
    }

    #[test]
    fn flexible_read_prefers_idle_die() {
        let mut ssd = Ssd::new(config(2, 4, 4, 0.0)).unwrap();
        ssd.record_history();
        ssd.write(0, 0.0).unwrap();
        ssd.write(1, 0.0).unwrap();
        ssd.run().unwrap();
        let (first, second) = (ssd.lookup(0), ssd.lookup(1));
        assert_ne!(first.die, second.die);

        // occupies one of the two dies while the read resolves
        ssd.write(6, 20_000.0).unwrap();
        ssd.read_flexible(0, vec![first, second], 20_001.5).unwrap();
        ssd.run().unwrap();

        let busy = ssd.lookup(6).die;
        let idle = if busy == first.die { second } else { first };
        let transfer = ssd.history().iter().find(|e| e.event_type == EventType::ReadTransfer).unwrap();
        assert_eq!(transfer.address, idle);
    }

    fn mixed_workload(deferring: bool) -> Stats {
        let mut config = config(2, 4, 4, 0.0);
        config.allow_deferring_transfers = deferring;
        config.scheduling_scheme = SchedulingScheme::ReadEraseWrite;
        let mut ssd = Ssd::new(config).unwrap();
        for lba in 0..8 {
            ssd.write(lba, lba as Time * 1000.0).unwrap();
        }
        ssd.run().unwrap();
        for lba in 0..8 {
            ssd.read(lba, 20_000.0).unwrap();
            ssd.write(8 + lba, 20_000.0).unwrap();
        }
        let stats = ssd.run().unwrap();
        assert_consistent(&ssd);
        stats
    }

    #[test]
    fn both_transfer_modes_complete_every_read() {
        for deferring in [false, true] {
            let stats = mixed_workload(deferring);
            assert_eq!(stats.reads, 8, "deferring transfers: {deferring}");
            assert_eq!(stats.writes, 16);
        }
    }

    #[test]
    fn wear_leveling_moves_static_data() {
        let mut config = config(1, 8, 4, 0.25);
        config.wear_leveling_threshold = 2;
        let mut ssd = Ssd::new(config).unwrap();
        ssd.record_history();
        for lba in 0..8 {
            ssd.write(lba, lba as Time * 5000.0).unwrap();
        }
        for i in 0..120 {
            ssd.write(8 + i % 2, 50_000.0 + i as Time * 5000.0).unwrap();
        }
        ssd.run().unwrap();

        assert!(ssd.history().iter().any(|e| e.event_type == EventType::Erase && e.wear_leveling_op));
        assert!(ssd.flash().block_by_index(0).erase_count() > 0);
        assert_consistent(&ssd);
    }

    #[test]
    fn overwrites_after_filling_the_logical_space() {
        let mut ssd = Ssd::new(config(1, 16, 8, 0.07)).unwrap();
        ssd.record_history();
        let logical = ssd.logical_size();
        assert_eq!(logical, 120);
        for lba in 0..logical {
            ssd.write(lba, lba as Time * 10_000.0).unwrap();
        }
        ssd.run().unwrap();
        assert_eq!(ssd.block_manager().num_available_pages_for_new_writes(), 1);

        let start = logical as Time * 10_000.0;
        for i in 0..24 {
            ssd.write(i * 5 % logical, start + i as Time * 10_000.0).unwrap();
        }
        let stats = ssd.run().unwrap();

        let overwrites = ssd
            .history()
            .iter()
            .filter(|e| e.event_type == EventType::Write && e.original_application_io && !e.noop)
            .count();
        assert_eq!(overwrites, logical + 24);
        assert!(stats.erases > 0);
        assert!((0..logical).all(|lba| ssd.lookup(lba).is_valid()));
        assert_consistent(&ssd);
    }

    /// 400 random reads and tagged writes, 1000us apart.
    fn random_workload(mut config: Config, seed: u64) {
        config.seed = seed;
        let mut ssd = Ssd::new(config).unwrap();
        let mut rng = SmallRng::seed_from_u64(seed);
        let logical = ssd.logical_size();
        for i in 0..400 {
            let lba = rng.gen_range(0..logical);
            let time = i as Time * 1000.0;
            if rng.gen_bool(0.2) {
                ssd.read(lba, time).unwrap();
            } else {
                let mut write = Event::application(EventType::Write, lba, time);
                write.tag = Some((lba % 3) as u32);
                ssd.submit(VecDeque::from([write]));
            }
        }
        let policy = ssd.config().block_manager;
        let copy_back = ssd.config().enable_copy_back;
        let stats = ssd
            .run()
            .unwrap_or_else(|e| panic!("{policy:?} with copy-back {copy_back}: {e}"));

        assert!(stats.erases > 0);
        assert_eq!(ssd.scheduler().pending_operations(), 0);
        assert_consistent(&ssd);
    }

    #[test]
    fn random_workload_conserves_pages() {
        random_workload(config(2, 8, 8, 0.25), 42);
    }

    #[test]
    fn every_placement_policy_conserves_pages() {
        let policies = [
            BlockManagerPolicy::RoundRobin,
            BlockManagerPolicy::ShortestQueue,
            BlockManagerPolicy::HotCold,
            BlockManagerPolicy::Tagged,
        ];
        for policy in policies {
            for copy_back in [false, true] {
                let mut config = config(2, 8, 8, 0.25);
                config.block_manager = policy;
                config.enable_copy_back = copy_back;
                random_workload(config, 7);
            }
        }
    }
}
