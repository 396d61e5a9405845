use std::time::Duration;

use facet::Facet;
use figue as args;
use tether_central::CentralConfig;

mod scenarios;
mod sim;

type AnyResult<T> = Result<T, String>;

const SIM_LATENCY_ENV: &str = "TETHER_SIM_LATENCY_MS";
const DEFAULT_SIM_LATENCY_MS: u64 = 50;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(args::named, default)]
    latency_ms: Option<u64>,
    #[facet(args::subcommand)]
    command: CommandKind,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum CommandKind {
    ConnectAndRead,
    CancelWhileQueued,
    Teardown,
}

pub struct Config {
    pub latency: Duration,
    pub central: CentralConfig,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> AnyResult<()> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config_from_cli(&cli)?;
    match cli.command {
        CommandKind::ConnectAndRead => scenarios::connect_and_read::run(&cfg).await,
        CommandKind::CancelWhileQueued => scenarios::cancel_while_queued::run(&cfg).await,
        CommandKind::Teardown => scenarios::teardown::run(&cfg).await,
    }
}

fn parse_cli() -> AnyResult<Cli> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("tether-examples")
                .description("Drive a simulated radio through tether scenarios")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();

    args::Driver::new(figue_config)
        .run()
        .into_result()
        .map(|v| v.value)
        .map_err(|e| e.to_string())
}

fn config_from_cli(cli: &Cli) -> AnyResult<Config> {
    let latency_ms = match cli.latency_ms {
        Some(ms) => ms,
        None => match std::env::var(SIM_LATENCY_ENV) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|e| format!("invalid {SIM_LATENCY_ENV}={raw:?}: {e}"))?,
            Err(_) => DEFAULT_SIM_LATENCY_MS,
        },
    };

    let central = CentralConfig::from_env().map_err(|e| e.to_string())?;

    Ok(Config {
        latency: Duration::from_millis(latency_ms),
        central,
    })
}
