use aikv_cluster_client::cluster::NodeReply;
use aikv_cluster_client::observability::init_logging;
use aikv_cluster_client::{ClientConfig, ClusterClient, Command, RespValue};
use anyhow::{bail, Context};
use tracing::debug;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_SEED: &str = "127.0.0.1:7000";

/// Command line arguments structure
struct CliArgs {
    config_path: Option<String>,
    seeds: Vec<String>,
    log_level: String,
    broadcast: bool,
    /// Positions (in the command, name excluded) of routing keys
    key_positions: Option<Vec<usize>>,
    command: Vec<String>,
    show_help: bool,
    show_version: bool,
}

fn print_help() {
    println!(
        "aikv-cluster-cli v{} - run one command against an AiKv / Redis cluster",
        VERSION
    );
    println!();
    println!("USAGE:");
    println!("    aikv-cluster-cli [OPTIONS] <COMMAND> [ARGS...]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>      Client configuration file (TOML format)");
    println!("    -s, --seeds <ADDRS>      Comma separated seed nodes (default: {})", DEFAULT_SEED);
    println!("    -k, --keys <POSITIONS>   Comma separated argument positions that are keys");
    println!("                             (default: the first argument; 'none' for keyless)");
    println!("    -b, --broadcast          Send the command to every master");
    println!("    -l, --log-level <LEVEL>  trace, debug, info, warn, error (default: warn)");
    println!("    -h, --help               Print help information");
    println!("    -v, --version            Print version information");
    println!();
    println!("EXAMPLES:");
    println!("    aikv-cluster-cli -s 10.0.0.1:7000 SET user:1 alice");
    println!("    aikv-cluster-cli -s 10.0.0.1:7000 -k 1,3 MSET {{u}}:a 1 {{u}}:b 2");
    println!("    aikv-cluster-cli -c cluster.toml --broadcast DBSIZE");
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        seeds: Vec::new(),
        log_level: "warn".to_string(),
        broadcast: false,
        key_positions: None,
        command: Vec::new(),
        show_help: false,
        show_version: false,
    };

    let mut i = 1;
    while i < args.len() {
        let value = |i: usize| {
            args.get(i + 1)
                .cloned()
                .with_context(|| format!("{} requires an argument", args[i]))
        };
        match args[i].as_str() {
            "-h" | "--help" => {
                cli.show_help = true;
                return Ok(cli);
            }
            "-v" | "--version" => {
                cli.show_version = true;
                return Ok(cli);
            }
            "-c" | "--config" => {
                cli.config_path = Some(value(i)?);
                i += 1;
            }
            "-s" | "--seeds" => {
                cli.seeds = value(i)?.split(',').map(|s| s.trim().to_string()).collect();
                i += 1;
            }
            "-l" | "--log-level" => {
                cli.log_level = value(i)?;
                i += 1;
            }
            "-k" | "--keys" => {
                let positions = value(i)?;
                cli.key_positions = Some(if positions == "none" {
                    Vec::new()
                } else {
                    positions.split(',')
                        .map(|p| p.trim().parse::<usize>())
                        .collect::<Result<_, _>>()
                        .with_context(|| format!("invalid key positions '{}'", positions))?
                });
                i += 1;
            }
            "-b" | "--broadcast" => cli.broadcast = true,
            _ => {
                cli.command = args[i..].to_vec();
                break;
            }
        }
        i += 1;
    }

    Ok(cli)
}

fn load_config(cli: &CliArgs) -> anyhow::Result<ClientConfig> {
    let mut config = match &cli.config_path {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("failed to load config file '{}'", path))?,
        None => ClientConfig::from_addrs([DEFAULT_SEED])?,
    };
    if !cli.seeds.is_empty() {
        config.seeds = ClientConfig::from_addrs(&cli.seeds)?.seeds;
    }
    Ok(config)
}

fn build_command(cli: &CliArgs) -> anyhow::Result<Command> {
    let Some((name, args)) = cli.command.split_first() else {
        bail!("no command given, use --help for usage");
    };

    let keys = cli
        .key_positions
        .clone()
        .unwrap_or_else(|| if args.is_empty() { Vec::new() } else { vec![1] });
    if let Some(bad) = keys.iter().find(|&&p| p == 0 || p > args.len()) {
        bail!("key position {} is out of range", bad);
    }

    Ok(args.iter().enumerate().fold(
        Command::new(name.clone()),
        |cmd, (i, arg)| {
            if keys.contains(&(i + 1)) {
                cmd.key(arg.clone())
            } else {
                cmd.arg(arg.clone())
            }
        },
    ))
}

/// Render a reply the way redis-cli does
fn format_reply(reply: &RespValue, indent: usize) -> String {
    let pad = " ".repeat(indent);
    match reply {
        RespValue::SimpleString(s) => s.clone(),
        RespValue::Error(e) | RespValue::BulkError(e) => format!("(error) {}", e),
        RespValue::Integer(n) => format!("(integer) {}", n),
        RespValue::Double(d) => format!("(double) {}", d),
        RespValue::Boolean(b) => format!("({})", b),
        RespValue::BigNumber(n) => format!("(big number) {}", n),
        RespValue::BulkString(Some(b)) => format!("\"{}\"", String::from_utf8_lossy(b)),
        RespValue::VerbatimString { data, .. } => format!("\"{}\"", String::from_utf8_lossy(data)),
        RespValue::BulkString(None) | RespValue::Array(None) | RespValue::Null => "(nil)".to_string(),
        RespValue::Array(Some(items)) | RespValue::Set(items) | RespValue::Push(items) => {
            if items.is_empty() {
                return "(empty array)".to_string();
            }
            items
                .iter()
                .enumerate()
                .map(|(i, item)| format!("{}{}) {}", pad, i + 1, format_reply(item, indent + 3)))
                .collect::<Vec<_>>()
                .join("\n")
        }
        RespValue::Map(entries) => entries
            .iter()
            .enumerate()
            .map(|(i, (k, v))| {
                format!(
                    "{}{}) {} => {}",
                    pad,
                    i + 1,
                    format_reply(k, indent + 3),
                    format_reply(v, indent + 3)
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn print_node_reply(reply: &NodeReply) {
    match &reply.result {
        Ok(value) => println!("{}: {}", reply.endpoint, format_reply(value, 0)),
        Err(e) => println!("{}: (error) {}", reply.endpoint, e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_args()?;
    if cli.show_help {
        print_help();
        return Ok(());
    }
    if cli.show_version {
        println!("aikv-cluster-cli {}", VERSION);
        return Ok(());
    }

    init_logging(&cli.log_level);
    let config = load_config(&cli)?;
    let command = build_command(&cli)?;

    let client = ClusterClient::connect(config)
        .await
        .context("failed to connect to the cluster")?;
    debug!("Topology version {}", client.topology().version());

    if cli.broadcast {
        for reply in client.broadcast(&command).await? {
            print_node_reply(&reply);
        }
    } else {
        let reply = client.query(&command).await?;
        println!("{}", format_reply(&reply, 0));
    }

    client.close();
    Ok(())
}
