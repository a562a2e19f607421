#[macro_use]
extern crate log;

use byte_unit::Byte;
use rand::prelude::*;
use simplelog::{ConfigBuilder, LevelFilter, SimpleLogger};
use time::macros::format_description;

use ssd_sim::config::{Lba, Time};
use ssd_sim::{Config, Result, Ssd};

fn run() -> Result<()> {
    let config = Config::default();
    let geo = config.geometry;
    // host writes arrive a little slower than the dies can absorb them
    let interval = (config.bus_ctrl_delay + config.bus_data_delay + config.page_write_delay)
        / geo.total_dies() as Time
        * 1.1;

    let mut ssd = Ssd::new(config)?;
    let max_lba = ssd.logical_size() - 1;
    info!(
        "Physical capacity {}, user capacity {}",
        Byte::from(geo.capacity_bytes()).get_appropriate_unit(true),
        Byte::from(ssd.logical_size() * geo.page_size).get_appropriate_unit(true)
    );

    let mut time: Time = 0.0;
    for lba in 0..=max_lba {
        ssd.write(lba, time)?;
        time += interval;
    }
    let stats = ssd.run()?;
    info!("Drive preconditioned: {stats}");

    let mut rng: SmallRng = SmallRng::seed_from_u64(7);

    for c in 0..4 {
        for _ in 0..=max_lba {
            let lba: Lba = rng.gen_range(0..=max_lba);
            ssd.write(lba, time)?;
            time += interval;
        }
        let stats = ssd.run()?;
        info!("Capacity {} randomly written: {stats}", c);
    }

    let bm = ssd.block_manager();
    info!(
        "{} free pages, {} available for new writes, {} gc migrations",
        bm.num_free_pages(),
        bm.num_available_pages_for_new_writes(),
        ssd.stats().migrations
    );
    Ok(())
}

fn main() {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();

    SimpleLogger::init(LevelFilter::Info, log_cfg).unwrap();

    if let Err(err) = run() {
        error!("Simulation failed: {err}");
        std::process::exit(1);
    }
}
