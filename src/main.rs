use clap::Parser;

use netplugin::{daemon, Config};

fn main() {
    daemon(Config::parse());
}
