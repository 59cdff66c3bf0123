use anyhow::Context;

pub(crate) struct Args {
    pub config_path: Option<String>,
    pub registry_path: Option<String>,
    pub servers: Vec<String>,
    pub username: String,
    pub relay: Option<String>,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = None;
    let mut registry_path = None;
    let mut servers = Vec::new();
    let mut username = std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string());
    let mut relay = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("chorus-client {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("chorus-client - multi-server chat/voice client");
                println!();
                println!("USAGE:");
                println!("    chorus-client [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --config <PATH>       Configuration file (TOML)");
                println!("    --registry <PATH>     Server registry file [default: ./servers.toml]");
                println!("    --server <URL>        Server to connect (repeatable)");
                println!("    --username <NAME>     Username for first-time auth [default: $USER]");
                println!("    --relay <ADDR>        Media relay to join (host:port)");
                println!("    -V, --version         Print version and exit");
                println!("    -h, --help            Print this help and exit");
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                config_path = Some(args.get(i).context("Missing --config value")?.clone());
            }
            "--registry" => {
                i += 1;
                registry_path = Some(args.get(i).context("Missing --registry value")?.clone());
            }
            "--server" => {
                i += 1;
                servers.push(args.get(i).context("Missing --server value")?.clone());
            }
            "--username" => {
                i += 1;
                username = args.get(i).context("Missing --username value")?.clone();
            }
            "--relay" => {
                i += 1;
                relay = Some(args.get(i).context("Missing --relay value")?.clone());
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args { config_path, registry_path, servers, username, relay })
}
