//! A router node: forwarding and route exchange, no transport.
//!
//! ```text
//! vrouter --config router.lnx
//! ```
use std::path::PathBuf;
use std::process;

use structopt::StructOpt;

use vnet_node::config::{NodeConfig, RoutingMode};
use vnet_node::node::{Node, Role};
use vnet_node::shell;

#[derive(StructOpt)]
#[structopt(name = "vrouter", about = "A virtual router node")]
struct Opt {
    /// The topology file describing this node.
    #[structopt(long = "config", parse(from_os_str))]
    config: PathBuf,
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    let config = match NodeConfig::from_file(&opt.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("vrouter: {}: {}", opt.config.display(), err);
            process::exit(1);
        }
    };
    if config.routing != RoutingMode::Rip {
        eprintln!("vrouter: note: `routing rip` is not set, running static-only");
    }

    let node = match Node::start(&config, Role::Router) {
        Ok(node) => node,
        Err(err) => {
            eprintln!("vrouter: failed to start: {}", err);
            process::exit(1);
        }
    };

    shell::run(&node);
}
