use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDate;
use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use snowball_crawler::{
    crawl_network, load_credentials, quota, Backend, Category, CrawlerConfig, FrontierStore,
    HttpBackend, Identifier, OnError, Outcome, Strategy,
};
use tokio::runtime;

/// Snowball sampler for social network APIs
#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    #[command(name = "crawl")]
    Crawl(CrawlArgs),
    #[command(name = "status")]
    Status(DataArgs),
    #[command(name = "keys")]
    Keys(KeysArgs),
    #[command(name = "clear")]
    Clear(DataArgs),
    #[command(hide = true)]
    Completion,
}

/// Per-account cap, a number or `all`
#[derive(Debug, Clone, Copy)]
pub struct Cap(Option<usize>);

impl FromStr for Cap {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" | "none" => Ok(Self(None)),
            n => n.parse().map(|n| Self(Some(n))),
        }
    }
}

/// Run a crawl, or resume the one found in the data directory
#[derive(Debug, clap::Args)]
pub struct CrawlArgs {
    /// Accounts to start from, numeric ids or @handles
    pub seeds: Vec<Identifier>,
    /// Directory holding the crawl state and collected records
    #[arg(long, short)]
    pub data_dir: PathBuf,
    /// Directory of credential JSON files
    #[arg(long, short = 'k')]
    pub credentials: PathBuf,
    /// Optional default crawler yaml configuration file
    #[arg(env = "SNOWBALL_CRAWLER_CONFIG", long)]
    pub crawler_config: Option<PathBuf>,
    /// Override the number of hops to expand
    #[arg(long)]
    pub max_hops: Option<u32>,
    /// Override the stored data ceiling, in GB
    #[arg(long)]
    pub max_data_gb: Option<f64>,
    /// Remove the stored data ceiling
    #[arg(long, conflicts_with = "max_data_gb")]
    pub no_data_limit: bool,
    /// Friends of each account queued for the next hop
    #[arg(long)]
    pub friends: Option<Cap>,
    /// Followers of each account queued for the next hop
    #[arg(long)]
    pub followers: Option<Cap>,
    /// Mentioned accounts of each timeline queued for the next hop
    #[arg(long)]
    pub mentions: Option<Cap>,
    /// Replied-to accounts of each timeline queued for the next hop
    #[arg(long)]
    pub replies: Option<Cap>,
    /// Friends kept on each account's record
    #[arg(long)]
    pub store_friends: Option<Cap>,
    /// Followers kept on each account's record
    #[arg(long)]
    pub store_followers: Option<Cap>,
    /// Oldest post collected from timelines (YYYY-MM-DD)
    #[arg(long)]
    pub since: Option<NaiveDate>,
    /// Newest post collected from timelines (YYYY-MM-DD)
    #[arg(long)]
    pub until: Option<NaiveDate>,
    /// Skip expanding accounts with more friends and followers than this
    #[arg(long)]
    pub max_degree: Option<u64>,
    /// Override the API base url
    #[arg(long)]
    pub base_url: Option<String>,
    /// Override crawler's user agent
    #[arg(long)]
    pub user_agent: Option<String>,
    /// Send every request through this proxy, e.g. http://host:port
    #[arg(env = "SNOWBALL_PROXY", long)]
    pub proxy: Option<String>,
    /// Override retries of transiently failing calls
    #[arg(long)]
    pub max_retries: Option<u32>,
    /// Override crawler's fetch error handling strategy
    #[arg(value_enum, long)]
    pub on_fetch_error: Option<OnError>,
    /// No SIGINT handling, the crawl can't stop cleanly
    #[arg(long)]
    pub no_sigint: bool,
    /// When quiet no logs are outputted
    #[arg(long, short)]
    pub quiet: bool,
}

fn read_config(path: Option<&PathBuf>) -> anyhow::Result<CrawlerConfig> {
    Ok(if let Some(file) = path.map(File::open) {
        serde_yaml::from_reader(file?)?
    } else {
        CrawlerConfig::default()
    })
}

impl TryFrom<&CrawlArgs> for CrawlerConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CrawlArgs) -> Result<Self, Self::Error> {
        let mut conf = read_config(args.crawler_config.as_ref())?;
        let limits = &mut conf.limits;
        if let Some(max_hops) = args.max_hops {
            limits.max_hops = max_hops;
        }
        if let Some(max_data_gb) = args.max_data_gb {
            limits.max_data_gb = Some(max_data_gb);
        }
        if args.no_data_limit {
            limits.max_data_gb = None;
        }
        for (cap, field) in [
            (args.friends, &mut limits.expand.friends),
            (args.followers, &mut limits.expand.followers),
            (args.mentions, &mut limits.expand.mentions),
            (args.replies, &mut limits.expand.replies),
            (args.store_friends, &mut limits.store.friends),
            (args.store_followers, &mut limits.store.followers),
        ] {
            if let Some(Cap(cap)) = cap {
                *field = cap;
            }
        }
        if let Some(since) = args.since {
            conf.timeline_since = Some(since);
        }
        if let Some(until) = args.until {
            conf.timeline_until = Some(until);
        }
        if let Some(max_degree) = args.max_degree {
            conf.strategy = Strategy::RelevanceFiltered {
                max_degree: Some(max_degree),
            };
        }
        if let Some(base_url) = &args.base_url {
            conf.api.base_url = base_url.to_string();
        }
        if let Some(user_agent) = &args.user_agent {
            conf.api.user_agent = user_agent.to_string();
        }
        if let Some(proxy) = &args.proxy {
            conf.api.proxy = Some(proxy.to_string());
        }
        if let Some(max_retries) = args.max_retries {
            conf.max_retries = max_retries;
        }
        if let Some(on_fetch_error) = args.on_fetch_error {
            conf.on_fetch_error = on_fetch_error;
        }
        if args.no_sigint {
            conf.handle_sigint = false;
        }
        Ok(conf)
    }
}

pub fn crawl(args: CrawlArgs) -> anyhow::Result<()> {
    let conf: CrawlerConfig = (&args).try_into()?;
    let credentials = load_credentials(&args.credentials)?;
    let backend = HttpBackend::new(&conf.api)?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let report = rt.block_on(crawl_network(
        &conf,
        &args.data_dir,
        &args.seeds,
        backend,
        credentials,
    ))?;

    let how = match report.outcome {
        Outcome::Completed => "completed",
        Outcome::VolumeLimit => "stopped at the data ceiling",
        Outcome::Interrupted => "interrupted, run again to resume",
    };
    println!(
        "Crawl {how}: hop {}, {} visited, {} unreachable, {} queued, {:.3} GB",
        report.hop,
        report.visited,
        report.unreachable,
        report.frontier,
        quota::to_gb(report.stored_bytes)
    );
    Ok(())
}

/// A crawl data directory
#[derive(Debug, clap::Args)]
pub struct DataArgs {
    /// Directory holding the crawl state and collected records
    #[arg(long, short)]
    pub data_dir: PathBuf,
}

/// Show where the crawl in a data directory stands
pub fn status(args: DataArgs) -> anyhow::Result<()> {
    let store = FrontierStore::open(&args.data_dir)?;
    let loaded = store.load()?;
    let state = &loaded.state;
    println!("state:       {:?}", loaded.origin);
    println!("hop:         {}", state.hop);
    println!("current:     {}", state.current.len());
    println!("next:        {}", state.next.len());
    println!("visited:     {}", state.visited.len());
    println!("unreachable: {}", state.unreachable.len());
    println!("collected:   {:.3} GB", quota::to_gb(store.stored_bytes()));
    Ok(())
}

/// Drop the frontier snapshots, collected records are kept
pub fn clear(args: DataArgs) -> anyhow::Result<()> {
    FrontierStore::open(&args.data_dir)?.clear()
}

/// Check every credential against the API
#[derive(Debug, clap::Args)]
pub struct KeysArgs {
    /// Directory of credential JSON files
    #[arg(long, short = 'k')]
    pub credentials: PathBuf,
    /// Optional default crawler yaml configuration file
    #[arg(env = "SNOWBALL_CRAWLER_CONFIG", long)]
    pub crawler_config: Option<PathBuf>,
    /// Override the API base url
    #[arg(long)]
    pub base_url: Option<String>,
    /// Send every request through this proxy, e.g. http://host:port
    #[arg(env = "SNOWBALL_PROXY", long)]
    pub proxy: Option<String>,
}

pub fn keys(args: KeysArgs) -> anyhow::Result<()> {
    let mut conf = read_config(args.crawler_config.as_ref())?;
    if let Some(base_url) = args.base_url {
        conf.api.base_url = base_url;
    }
    if let Some(proxy) = args.proxy {
        conf.api.proxy = Some(proxy);
    }
    let credentials = load_credentials(&args.credentials)?;
    let mut backend = HttpBackend::new(&conf.api)?;

    let rt = runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(async {
        for credential in &credentials {
            match backend.authoritative_quota(credential, Category::Users).await {
                Ok(quota) => println!(
                    "{}: ok, {}/{} calls left until {}",
                    credential.name, quota.remaining, quota.limit, quota.reset
                ),
                Err(e) => println!("{}: {e}", credential.name),
            }
        }
    });
    Ok(())
}

fn init_logs() {
    let env = env_logger::Env::default().default_filter_or("snowball_crawler=info");
    env_logger::Builder::from_env(env).init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.cmd {
        SubCommand::Crawl(args) => {
            if !args.quiet {
                init_logs();
            }
            crawl(args)
        }
        SubCommand::Status(args) => status(args),
        SubCommand::Keys(args) => {
            init_logs();
            keys(args)
        }
        SubCommand::Clear(args) => {
            init_logs();
            clear(args)
        }
        SubCommand::Completion => {
            generate(Shell::Bash, &mut Args::command(), "snowball", &mut io::stdout());
            Ok(())
        }
    }
}
