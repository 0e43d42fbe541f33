//! A host node: the full stack including the transport layer.
//!
//! ```text
//! vhost --config host.lnx
//! ```
use std::path::PathBuf;
use std::process;

use structopt::StructOpt;

use vnet_node::config::NodeConfig;
use vnet_node::node::{Node, Role};
use vnet_node::shell;

#[derive(StructOpt)]
#[structopt(name = "vhost", about = "A virtual host node")]
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
            eprintln!("vhost: {}: {}", opt.config.display(), err);
            process::exit(1);
        }
    };

    let node = match Node::start(&config, Role::Host) {
        Ok(node) => node,
        Err(err) => {
            eprintln!("vhost: failed to start: {}", err);
            process::exit(1);
        }
    };

    shell::run(&node);
}
