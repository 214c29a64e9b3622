use clap::Parser;
use pingora::server::configuration::Opt;

use ratelimit_gateway::configuration::GatewayConfig;
use ratelimit_gateway::server::Server;

fn main() {
    // Enable basic logging; set RUST_LOG=info for visibility.
    env_logger::init();

    let opt = Opt::parse();
    let conf_path = opt.conf.clone().unwrap_or_else(|| "gateway.yaml".to_string());

    let mut server = Server::new(Some(opt)).expect("failed to create server");

    let config = GatewayConfig::load(&conf_path).expect("failed to load gateway config");
    server.bootstrap(config).expect("failed to bootstrap gateway");

    server.run_forever();
}
