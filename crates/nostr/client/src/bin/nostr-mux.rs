#![expect(clippy::print_stdout, reason = "command line output")]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use nostr::{Event, EventTemplate, Filter, finalize_event};
use nostr_client::{
    FileConfig, PoolConfig, PublishOptions, RelayConnection, RelayPool, SubscribeOptions,
    SubscriptionUpdate,
};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "nostr-mux")]
#[command(about = "Talk to many Nostr relays as if they were one")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe and print matching events as JSON lines
    Tail(TailArgs),
    /// Publish a signed event and print one result per relay
    Publish(PublishArgs),
    /// Sign an event with a hex secret key and print it
    Sign(SignArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Relay URL (repeatable)
    #[arg(long = "relay")]
    relays: Vec<String>,
    /// TOML file with pool settings and relays
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TailArgs {
    #[command(flatten)]
    relays: RelayArgs,
    #[arg(long = "kind")]
    kinds: Vec<u16>,
    #[arg(long = "author")]
    authors: Vec<String>,
    #[arg(long)]
    since: Option<u64>,
    #[arg(long)]
    limit: Option<u64>,
    /// Exit once every relay reported end of stored events
    #[arg(long)]
    until_eose: bool,
}

#[derive(Args, Debug)]
struct PublishArgs {
    #[command(flatten)]
    relays: RelayArgs,
    /// Signed event JSON
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct SignArgs {
    #[arg(long)]
    secret_hex: String,
    #[arg(long)]
    kind: u16,
    #[arg(long, default_value = "")]
    content: String,
    /// Comma separated tag, e.g. `p,<pubkey>` (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Defaults to now
    #[arg(long)]
    created_at: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Tail(args) => tail(args).await,
        Command::Publish(args) => publish(args).await,
        Command::Sign(args) => sign(&args),
    }
}

/// Build a pool from `--config` and `--relay` and wait briefly for connections.
async fn open_pool(args: &RelayArgs) -> Result<RelayPool> {
    let file = match &args.config {
        Some(path) => Some(
            FileConfig::from_path(path)
                .with_context(|| format!("load config {}", path.display()))?,
        ),
        None => None,
    };
    let config = file
        .as_ref()
        .map_or_else(PoolConfig::default, FileConfig::pool_config);
    let connect_timeout = config.relay_config.connect_timeout;
    let pool = RelayPool::new(config);

    let mut added = 0usize;
    if let Some(file) = &file {
        for (url, relay_config) in file.relay_configs() {
            if pool
                .add_connection(RelayConnection::from_url(url, relay_config))
                .await?
            {
                added += 1;
            }
        }
    }
    for url in &args.relays {
        if pool
            .add_relay(url)
            .await
            .with_context(|| format!("add relay {url}"))?
        {
            added += 1;
        }
    }
    if added == 0 {
        bail!("no relays given; use --relay or a config file with [[relays]]");
    }

    if !pool.wait_until_healthy(added, connect_timeout).await? {
        info!(
            "{} of {} relays connected",
            pool.healthy_count().await?,
            added
        );
    }
    Ok(pool)
}

async fn tail(args: TailArgs) -> Result<()> {
    let mut filter = Filter::new();
    if !args.kinds.is_empty() {
        filter = filter.kinds(args.kinds);
    }
    if !args.authors.is_empty() {
        filter = filter.authors(args.authors);
    }
    if let Some(since) = args.since {
        filter = filter.since(since);
    }
    if let Some(limit) = args.limit {
        filter = filter.limit(limit);
    }

    let pool = open_pool(&args.relays).await?;
    let (options, mut updates) = SubscribeOptions::channel(vec![filter]);
    let subscription_id = pool.subscribe(options).await?;
    debug!("subscribed as {}", subscription_id);

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(SubscriptionUpdate::Events(events)) => {
                    for received in events {
                        println!("{}", serde_json::to_string(&received.event)?);
                    }
                }
                Some(SubscriptionUpdate::Eose(_)) => {
                    info!("end of stored events");
                    if args.until_eose {
                        break;
                    }
                }
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                result.context("listen for ctrl-c")?;
                break;
            }
        }
    }

    pool.unsubscribe(&subscription_id).await?;
    while let Ok(update) = updates.try_recv() {
        if let SubscriptionUpdate::Events(events) = update {
            for received in events {
                println!("{}", serde_json::to_string(&received.event)?);
            }
        }
    }
    pool.shutdown().await?;
    Ok(())
}

async fn publish(args: PublishArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("read event {}", args.file.display()))?;
    let event: Event = serde_json::from_str(&text)
        .with_context(|| format!("parse event {}", args.file.display()))?;

    let pool = open_pool(&args.relays).await?;
    let (mut options, done) = PublishOptions::completion();
    if let Some(timeout_ms) = args.timeout_ms {
        options = options.timeout(Duration::from_millis(timeout_ms));
    }
    pool.publish(event, options).await?;
    let results = done.await.context("publish results")?;
    pool.shutdown().await?;

    let mut accepted = 0usize;
    for ack in &results {
        let status = if ack.accepted { "accepted" } else { "rejected" };
        println!("{}\t{}\t{}", ack.relay, status, ack.message);
        if ack.accepted {
            accepted += 1;
        }
    }
    if accepted == 0 {
        bail!("no relay accepted event");
    }
    Ok(())
}

fn sign(args: &SignArgs) -> Result<()> {
    let secret: [u8; 32] = hex::decode(args.secret_hex.trim())
        .context("decode secret key hex")?
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow!("secret key must be 32 bytes, got {}", bytes.len()))?;

    let created_at = match args.created_at {
        Some(created_at) => created_at,
        None => std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .context("system clock before unix epoch")?
            .as_secs(),
    };
    let template = EventTemplate {
        created_at,
        kind: args.kind,
        tags: parse_tags(&args.tags),
        content: args.content.clone(),
    };
    let event = finalize_event(&template, &secret).context("sign event")?;
    println!("{}", serde_json::to_string(&event)?);
    Ok(())
}

fn parse_tags(raw: &[String]) -> Vec<Vec<String>> {
    raw.iter()
        .map(|tag| tag.split(',').map(str::to_string).collect())
        .collect()
}
