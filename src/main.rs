//! Tag server entry point.
//!
//! Parses the command line, loads the configuration, and runs the server
//! until a termination signal arrives. Exit status is zero on a clean
//! shutdown and nonzero on a fatal initialization failure.

use opendax::server::{parse_args, ServerConfig, TagServer, USAGE};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("tagserver: {}", e);
            eprint!("{}", USAGE);
            std::process::exit(2);
        }
    };
    if opts.help {
        print!("{}", USAGE);
        return Ok(());
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::load(&opts)?;
    log::info!("OpenDAX tag server {}", opendax::VERSION);
    log::info!("socket: {}", config.socket_path.display());
    if let Some(port) = config.tcp_port {
        log::info!("tcp: {}:{}", config.tcp_host, port);
    }
    log::info!("retention: {}", config.retention_file.display());

    TagServer::new(config).run().await
}
