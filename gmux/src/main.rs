use clap::Parser;
use log::{error, info};

use gmux::config::Config;
use gmux::device::Device;
use gmux::session::Server;
use gmux::{logger, sched};

fn main() {
    let config = Config::parse();
    logger::init(config.verbose);

    info!("gmux {} mediating GPU at {}", gmux::VERSION, config.bdf);
    info!(
        "through: {}, lazy shadowing: {}, BAR3 remapping: {}",
        config.through, config.lazy_shadowing, config.bar3_remapping
    );

    let device = match Device::open(config.clone()) {
        Ok(device) => device,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let scheduler = sched::create(config.scheduler, device.clone());
    scheduler.start();

    let server = match Server::bind(device, scheduler.clone(), &config.endpoint) {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            scheduler.stop();
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!("{}", e);
    }
    scheduler.stop();
}
