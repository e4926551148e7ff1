use clap::Parser;
use sip_presence_publisher::diagnostics::{handle_line, KeyAction, HELP_TEXT};
use sip_presence_publisher::{
    create_publisher, utils, AccountConfig, Config, ConfigError, ControllerHandle,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

/// Keep a rich presence document published to a SIP Presence Agent
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SIP account (e.g., alice@example.com)
    #[arg(short, long, env = "SIP_ACCOUNT")]
    account: Option<String>,

    /// SIP password
    #[arg(short, long, env = "SIP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Outbound proxy (e.g., proxy.example.com:5060;transport=tcp)
    #[arg(short, long, env = "SIP_OUTBOUND_PROXY")]
    outbound_proxy: Option<String>,

    /// Transports to try, in order
    #[arg(long, default_value = "udp,tcp")]
    transports: String,

    /// Seconds between publications
    #[arg(short, long, default_value_t = 60)]
    interval: u64,

    /// Expiry of each publication in seconds
    #[arg(long, default_value_t = 600)]
    expires: u32,

    /// User-Agent string
    #[arg(long)]
    user_agent: Option<String>,

    /// Log SIP messages
    #[arg(short = 's', long)]
    trace_sip: bool,

    /// Log controller events and published documents
    #[arg(short = 'n', long)]
    trace_notifications: bool,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn build_config(args: &Args) -> Result<Config, ConfigError> {
    let account = args
        .account
        .as_deref()
        .ok_or_else(|| ConfigError::Missing("account (--account or SIP_ACCOUNT)".to_string()))?;
    let account = AccountConfig::parse(account, args.password.clone().unwrap_or_default())?;

    let mut config = Config::new(vec![account])
        .with_outbound_proxy(args.outbound_proxy.as_deref())?
        .with_transports(&args.transports)?
        .with_interval(args.interval)?
        .with_expires(args.expires)?;
    if let Some(user_agent) = &args.user_agent {
        config.user_agent = user_agent.clone();
    }
    config.trace_sip = args.trace_sip;
    config.trace_notifications = args.trace_notifications;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    utils::initialize_logging(args.log_level.as_str());

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match run(config).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(config: Config) -> Result<bool, Box<dyn std::error::Error>> {
    let (controller, client) = create_publisher(&config, None).await?;
    let handle = controller.handle();
    let flags = controller.flags();

    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            ctrl_c.stop();
        }
    });

    tokio::spawn(read_keys(handle, flags));

    println!("Type ? and Enter for help");
    let success = controller.run().await;
    client.shutdown().await;
    Ok(success)
}

async fn read_keys(
    handle: ControllerHandle,
    flags: std::sync::Arc<sip_presence_publisher::DiagnosticFlags>,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match handle_line(&flags, &line) {
                KeyAction::Help => println!("{}", HELP_TEXT),
                KeyAction::Quit => break,
                KeyAction::Toggled | KeyAction::Ignored => {}
            },
            Ok(None) => break,
            Err(e) => {
                error!("读取输入失败: {}", e);
                break;
            }
        }
    }
    handle.stop();
}
